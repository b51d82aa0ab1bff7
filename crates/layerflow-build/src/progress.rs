use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// ターゲット1つ分のスピナー
pub struct BuildProgress {
    progress_bar: ProgressBar,
}

impl BuildProgress {
    pub fn new(target: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        // テンプレートが不正なら既定のスタイルのまま
        if let Ok(style) =
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message(format!("Building {}...", target));
        pb.enable_steady_tick(Duration::from_millis(120));

        Self { progress_bar: pb }
    }

    /// 表示しない（非対話環境やテスト用）
    pub fn hidden() -> Self {
        Self {
            progress_bar: ProgressBar::hidden(),
        }
    }

    pub fn set_message(&self, msg: &str) {
        self.progress_bar.set_message(msg.to_string());
    }

    pub fn finish_success(&self, built: usize) {
        let message = if built == 0 {
            "Up to date ✓".to_string()
        } else {
            format!("Built {} stage(s) ✓", built)
        };
        self.progress_bar.finish_with_message(message);
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("Build failed: {}", error));
    }
}
