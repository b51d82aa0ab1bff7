//! ステージ1つ分のビルド指示の組み立てと実行
//!
//! アーカイブやパッチ、アーティファクトの受け渡しファイルは一時ディレクトリに置き、
//! コンテナの `/.layerflow/tmp` にバインドします。一時ディレクトリは実行後に消えます。

use crate::BUILD_CACHE_VERSION;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::git_artifact::{CONTAINER_TMP_DIR, PatchContribution, chown_command};
use crate::labels;
use crate::planner::TargetPlan;
use crate::recipe::playbook_yaml;
use crate::stage::{ArtifactExport, BuilderInputs, GitArchiveInput, StageKind};
use flate2::Compression;
use flate2::write::GzEncoder;
use layerflow_container::Instructions;
use layerflow_core::StageName;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

const CHEF_COOKBOOKS_DIR: &str = "/.layerflow/chef/cookbooks";
const ANSIBLE_DIR: &str = "/.layerflow/ansible";

/// 実行待ちの指示（一時ディレクトリを保持）
pub struct PreparedStage {
    pub instructions: Instructions,
    tmp: TempDir,
}

impl PreparedStage {
    pub fn tmp_dir(&self) -> &Path {
        self.tmp.path()
    }
}

pub struct StageRunner<'a> {
    ctx: &'a BuildContext,
}

impl<'a> StageRunner<'a> {
    pub fn new(ctx: &'a BuildContext) -> Self {
        Self { ctx }
    }

    /// ステージをビルドして新しいイメージIDを返す
    pub async fn run(&self, plan: &TargetPlan, index: usize, from_id: &str) -> Result<String> {
        let prepared = self.prepare(plan, index, from_id).await?;
        let id = self
            .ctx
            .runtime()
            .build(from_id, &prepared.instructions)
            .await?;
        Ok(id)
    }

    /// ステージの指示を組み立てる（`from` ステージは対象外）
    pub async fn prepare(&self, plan: &TargetPlan, index: usize, from_id: &str) -> Result<PreparedStage> {
        let ctx = self.ctx;
        let project = ctx.project();
        let stage = plan
            .chain
            .get(index)
            .ok_or_else(|| BuildError::UnknownTarget(format!("{}#{}", plan.name(), index)))?;
        let signature = plan.chain.signature(index);

        let tmp_root = ctx.build_dir().join("tmp");
        std::fs::create_dir_all(&tmp_root).map_err(|e| BuildError::file(&tmp_root, e))?;
        let tmp = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&tmp_root)
            .map_err(|e| BuildError::file(&tmp_root, e))?;

        let mut instructions = Instructions {
            name: Some(format!(
                "{}{}.{}",
                labels::build_container_prefix(project),
                &signature[..signature.len().min(12)],
                chrono::Utc::now().timestamp_millis()
            )),
            keep_on_error: ctx.options().introspect_error,
            ..Default::default()
        };
        instructions
            .labels
            .insert(labels::PROJECT_LABEL.to_string(), project.to_string());
        instructions.labels.insert(
            labels::CACHE_VERSION_LABEL.to_string(),
            BUILD_CACHE_VERSION.to_string(),
        );
        instructions
            .labels
            .insert(labels::PARENT_LABEL.to_string(), from_id.to_string());
        instructions
            .binds
            .push(format!("{}:{}", tmp.path().display(), CONTAINER_TMP_DIR));

        match stage.kind() {
            StageKind::From { image, .. } => {
                return Err(BuildError::SignatureInputUnavailable(format!(
                    "base image {} is pulled, not built",
                    image
                )));
            }
            StageKind::Builder(builder) => {
                self.builder_instructions(stage.name(), &builder.inputs, tmp.path(), &mut instructions)
                    .await?;
            }
            StageKind::Artifacts(exports) => {
                self.artifact_instructions(stage.name(), exports, tmp.path(), &mut instructions)
                    .await?;
            }
            StageKind::GitArchive(archives) => {
                self.archive_instructions(archives, tmp.path(), &mut instructions)
                    .await?;
            }
            StageKind::GitPatch(patches) => {
                self.patch_instructions(patches, tmp.path(), &mut instructions)
                    .await?;
            }
            StageKind::DockerInstructions(directives) => {
                instructions.changes = directives.clone();
            }
        }

        Ok(PreparedStage { instructions, tmp })
    }

    async fn builder_instructions(
        &self,
        stage: StageName,
        inputs: &BuilderInputs,
        tmp: &Path,
        instructions: &mut Instructions,
    ) -> Result<()> {
        let ctx = self.ctx;
        match inputs {
            BuilderInputs::Shell { commands, .. } => {
                instructions.commands.extend(commands.iter().cloned());
            }
            BuilderInputs::Chef {
                recipe,
                attributes,
                runlist,
            } => {
                let cookbooks = recipe
                    .materialize(ctx.build_dir(), ctx.project(), ctx.locks())
                    .await?;
                instructions
                    .binds
                    .push(format!("{}:{}:ro", cookbooks.display(), CHEF_COOKBOOKS_DIR));

                write_file(
                    &tmp.join("solo.rb"),
                    format!("cookbook_path [\"{}\"]\n", CHEF_COOKBOOKS_DIR).as_bytes(),
                )?;
                let mut node = attributes.clone();
                node.insert(
                    "run_list".to_string(),
                    serde_json::Value::Array(
                        runlist
                            .iter()
                            .map(|r| serde_json::Value::String(format!("recipe[{}]", r)))
                            .collect(),
                    ),
                );
                let json = serde_json::to_vec_pretty(&serde_json::Value::Object(node))
                    .map_err(|e| BuildError::SignatureInputUnavailable(e.to_string()))?;
                write_file(&tmp.join(format!("{}.json", stage)), &json)?;

                instructions.commands.push(format!(
                    "chef-solo --legacy-mode -c {tmp}/solo.rb -j {tmp}/{stage}.json",
                    tmp = CONTAINER_TMP_DIR,
                    stage = stage
                ));
            }
            BuilderInputs::Ansible {
                playbook, tasks, ..
            } => {
                if let Some(dir) = playbook
                    .materialize(ctx.build_dir(), ctx.project(), ctx.locks())
                    .await?
                {
                    instructions
                        .binds
                        .push(format!("{}:{}:ro", dir.display(), ANSIBLE_DIR));
                    instructions.env.insert(
                        "ANSIBLE_ROLES_PATH".to_string(),
                        format!("{}/playbook/roles:{}", ANSIBLE_DIR, ANSIBLE_DIR),
                    );
                }
                write_file(
                    &tmp.join(format!("{}.yml", stage)),
                    playbook_yaml(tasks)?.as_bytes(),
                )?;
                instructions.commands.push(format!(
                    "ansible-playbook -i localhost, -c local {}/{}.yml",
                    CONTAINER_TMP_DIR, stage
                ));
            }
        }
        Ok(())
    }

    async fn artifact_instructions(
        &self,
        stage: StageName,
        exports: &[ArtifactExport],
        tmp: &Path,
        instructions: &mut Instructions,
    ) -> Result<()> {
        let mut ids = Vec::with_capacity(exports.len());
        for (n, export) in exports.iter().enumerate() {
            let image = export.sub_build.final_image_name();
            let metadata = self.ctx.images().metadata(&image).await?;
            let file = format!("artifact-{}.tar.gz", n);

            let copy = Instructions {
                binds: vec![format!("{}:{}", tmp.display(), CONTAINER_TMP_DIR)],
                commands: vec![export_command(export, &file)],
                keep_on_error: instructions.keep_on_error,
                ..Default::default()
            };
            tracing::debug!(artifact = %export.import.artifact, image = %image, "Exporting artifact files");
            self.ctx.runtime().run(&metadata.id, &copy).await?;

            let import = &export.import;
            instructions.commands.push(format!("mkdir -p {}", import.to));
            instructions.commands.push(format!(
                "tar -xzf {}/{} -C {}",
                CONTAINER_TMP_DIR, file, import.to
            ));
            instructions.commands.extend(chown_command(
                import.owner.as_deref(),
                import.group.as_deref(),
                &import.to,
            ));
            ids.push(metadata.id);
        }
        instructions
            .labels
            .insert(labels::artifacts_label(stage), ids.join(","));
        Ok(())
    }

    async fn archive_instructions(
        &self,
        archives: &[GitArchiveInput],
        tmp: &Path,
        instructions: &mut Instructions,
    ) -> Result<()> {
        let vcs = self.ctx.git().vcs();
        for input in archives {
            let artifact = &input.artifact;
            let tar = vcs
                .archive(&input.repo.path, &input.repo.commit, &artifact.export_filter())
                .await?;
            let file = format!("{}.tar.gz", artifact.id());
            write_file(&tmp.join(&file), &gzip(&tar)?)?;

            instructions.commands.extend(artifact.archive_commands(&file));
            instructions
                .labels
                .insert(artifact.commit_label(), input.repo.commit.clone());
        }
        Ok(())
    }

    async fn patch_instructions(
        &self,
        patches: &[PatchContribution],
        tmp: &Path,
        instructions: &mut Instructions,
    ) -> Result<()> {
        let vcs = self.ctx.git().vcs();
        for patch in patches {
            let artifact = &patch.artifact;
            let diff = vcs
                .diff(&patch.repo.path, &patch.from, &patch.to, &artifact.export_filter())
                .await?;
            instructions
                .labels
                .insert(artifact.commit_label(), patch.to.clone());
            if diff.is_empty() {
                continue;
            }
            let file = format!("{}.patch.gz", artifact.id());
            write_file(&tmp.join(&file), &gzip(&diff.diff)?)?;
            instructions.commands.extend(artifact.patch_commands(&file));
        }
        Ok(())
    }
}

/// アーティファクトイメージ内で `add` を tar.gz にまとめるコマンド
fn export_command(export: &ArtifactExport, file: &str) -> String {
    let import = &export.import;
    let mut command = format!("tar -czf {}/{} -C {}", CONTAINER_TMP_DIR, file, import.add);
    for exclude in &import.exclude_paths {
        command.push_str(&format!(" --exclude={}", exclude));
    }
    if import.include_paths.is_empty() {
        command.push_str(" .");
    } else {
        for include in &import.include_paths {
            command.push(' ');
            command.push_str(include);
        }
    }
    command
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content).map_err(|e| BuildError::file(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use layerflow_core::{ArtifactAnchor, ArtifactImport, TargetConfig};
    use std::io::Read;
    use std::sync::Arc;

    #[test]
    fn test_gzip_roundtrip() {
        let compressed = gzip(b"diff --git a/x b/x").unwrap();
        let mut out = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "diff --git a/x b/x");
    }

    #[test]
    fn test_export_command() {
        let mut import = ArtifactImport::new("assets", "/build/public", ArtifactAnchor::BeforeSetup)
            .with_to("/app/public");
        import.exclude_paths = vec!["*.map".into()];
        let export = ArtifactExport {
            import,
            sub_build: Arc::new(TargetPlan {
                config: TargetConfig::artifact("assets", "node:20"),
                chain: crate::chain::BuildStageChain::new("shop", "assets"),
                artifacts: Default::default(),
            }),
        };
        assert_eq!(
            export_command(&export, "artifact-0.tar.gz"),
            "tar -czf /.layerflow/tmp/artifact-0.tar.gz -C /build/public --exclude=*.map ."
        );

        let mut with_includes = export.clone();
        with_includes.import.include_paths = vec!["css".into(), "js".into()];
        with_includes.import.exclude_paths.clear();
        assert!(export_command(&with_includes, "a.tar.gz").ends_with("-C /build/public css js"));
    }
}
