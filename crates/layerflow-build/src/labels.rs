//! ステージイメージの名前とラベル

use layerflow_core::StageName;

/// プロジェクト名を値に持つマーカーラベル
pub const PROJECT_LABEL: &str = "layerflow";
pub const CACHE_VERSION_LABEL: &str = "layerflow-cache-version";
/// ビルド元イメージID（レジストリ上で親をたどるため）
pub const PARENT_LABEL: &str = "layerflow-parent";

const GIT_LABEL_PREFIX: &str = "layerflow-git-";
const GIT_LABEL_SUFFIX: &str = "-commit";
const ARTIFACTS_LABEL_PREFIX: &str = "layerflow-artifacts-";

/// レジストリに送るステージタグの接頭辞
pub const STAGE_TAG_PREFIX: &str = "dimgstage-";

/// `<project>-stages`
pub fn stages_repository(project: &str) -> String {
    format!("{}-stages", project)
}

/// `<project>-stages:<signature>`
pub fn stage_image_name(project: &str, signature: &str) -> String {
    format!("{}:{}", stages_repository(project), signature)
}

/// `<repo>:dimgstage-<signature>`
pub fn stage_tag_name(repo: &str, signature: &str) -> String {
    format!("{}:{}{}", repo, STAGE_TAG_PREFIX, signature)
}

/// git アーティファクトのコミットを記録するラベル
pub fn git_commit_label(artifact_id: &str) -> String {
    format!("{}{}{}", GIT_LABEL_PREFIX, artifact_id, GIT_LABEL_SUFFIX)
}

/// ラベル名から git アーティファクトIDを取り出す
pub fn parse_git_commit_label(label: &str) -> Option<&str> {
    label
        .strip_prefix(GIT_LABEL_PREFIX)?
        .strip_suffix(GIT_LABEL_SUFFIX)
        .filter(|id| !id.is_empty())
}

/// import したアーティファクトのイメージIDを記録するラベル
pub fn artifacts_label(stage: StageName) -> String {
    format!("{}{}", ARTIFACTS_LABEL_PREFIX, stage)
}

pub fn is_artifacts_label(label: &str) -> bool {
    label.starts_with(ARTIFACTS_LABEL_PREFIX)
}

/// ビルドコンテナ名の接頭辞（GC で残骸を探す）
pub fn build_container_prefix(project: &str) -> String {
    format!("layerflow.build.{}.", project)
}
