//! ステージチェーンのビルドとシグネチャの統合テスト

mod common;

use common::{Fixture, shell, shell_image};
use layerflow_build::{BuildError, Conveyor, TargetPlan};
use layerflow_container::{ContainerFilter, ContainerRuntime};
use layerflow_core::{
    ArtifactAnchor, ArtifactImport, BuilderConfig, GitArtifactConfig, GitPin, StageName,
    TargetConfig,
};
use std::sync::Arc;

async fn plan_one(fixture: &Fixture, manifest: layerflow_core::Manifest) -> Arc<TargetPlan> {
    let conveyor = Conveyor::new(fixture.context(manifest));
    conveyor.plan(&[]).await.unwrap().remove(0)
}

fn signatures(plan: &TargetPlan) -> Vec<String> {
    (0..plan.chain.len())
        .map(|i| plan.chain.signature(i).to_string())
        .collect()
}

#[tokio::test]
async fn test_signatures_are_deterministic() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(shell_image(
        None,
        &[
            (StageName::BeforeInstall, "apk add curl"),
            (StageName::Setup, "echo setup"),
        ],
    ));

    let first = plan_one(&fixture, manifest.clone()).await;
    let second = plan_one(&fixture, manifest).await;

    assert_eq!(signatures(&first), signatures(&second));
    assert_eq!(first.signature().len(), 64);
}

#[tokio::test]
async fn test_changed_input_invalidates_stage_and_later_only() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(shell_image(
        None,
        &[
            (StageName::BeforeInstall, "apk add curl"),
            (StageName::Install, "bundle install"),
            (StageName::Setup, "rake assets:precompile"),
        ],
    ));
    let mut changed = manifest.clone();
    changed.images[0].builder = BuilderConfig::Shell(shell(&[
        (StageName::BeforeInstall, "apk add curl"),
        (StageName::Install, "bundle install --deployment"),
        (StageName::Setup, "rake assets:precompile"),
    ]));

    let before = plan_one(&fixture, manifest).await;
    let after = plan_one(&fixture, changed).await;
    let install = StageName::Install.index();

    for index in 0..before.chain.len() {
        if index < install {
            assert_eq!(before.chain.signature(index), after.chain.signature(index));
        } else {
            assert_ne!(before.chain.signature(index), after.chain.signature(index));
        }
    }
}

#[tokio::test]
async fn test_empty_stage_passes_signature_through() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest
        .images
        .push(shell_image(None, &[(StageName::Setup, "echo setup")]));

    let plan = plan_one(&fixture, manifest).await;
    let chain = &plan.chain;

    assert!(chain.stage(StageName::Install).unwrap().is_empty());
    assert_eq!(
        chain.stage_signature(StageName::Install),
        chain.stage_signature(StageName::From)
    );
    assert_ne!(
        chain.stage_signature(StageName::Setup),
        chain.stage_signature(StageName::BeforeSetup)
    );
    assert_eq!(
        chain.stage_signature(StageName::DockerInstructions),
        chain.stage_signature(StageName::Setup)
    );
}

#[tokio::test]
async fn test_second_build_is_a_cache_hit() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest
        .images
        .push(shell_image(None, &[(StageName::Install, "echo hi")]));

    let outcomes = Conveyor::new(fixture.context(manifest.clone()))
        .build(&[])
        .await
        .unwrap();
    let summary = outcomes[0].result.as_ref().unwrap();
    assert_eq!(summary.built, vec![StageName::From, StageName::Install]);
    assert_eq!(fixture.runtime.build_count(), 1);
    assert!(fixture.runtime.has_tag(&summary.image_name));

    // 新しいプロセス相当（キャッシュは空）
    let outcomes = Conveyor::new(fixture.context(manifest))
        .build(&[])
        .await
        .unwrap();
    let summary = outcomes[0].result.as_ref().unwrap();
    assert!(summary.is_cached());
    assert_eq!(fixture.runtime.build_count(), 1);
}

#[tokio::test]
async fn test_targets_share_common_stages() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(shell_image(
        Some("backend"),
        &[
            (StageName::BeforeInstall, "apk add curl"),
            (StageName::Install, "bundle install"),
        ],
    ));
    manifest.images.push(shell_image(
        Some("frontend"),
        &[
            (StageName::BeforeInstall, "apk add curl"),
            (StageName::Install, "npm ci"),
        ],
    ));

    let conveyor = Conveyor::new(fixture.context(manifest));
    let plans = conveyor.plan(&[]).await.unwrap();
    assert_eq!(
        plans[0].chain.stage_signature(StageName::BeforeInstall),
        plans[1].chain.stage_signature(StageName::BeforeInstall)
    );

    let outcomes = conveyor.build(&[]).await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_success()));
    // before_install は1回だけ
    assert_eq!(fixture.runtime.build_count(), 3);
}

#[tokio::test]
async fn test_parallel_build_shares_stages() {
    let mut fixture = Fixture::new();
    fixture.settings.parallel = true;
    let mut manifest = fixture.manifest();
    for name in ["a", "b", "c"] {
        manifest.images.push(shell_image(
            Some(name),
            &[
                (StageName::BeforeInstall, "apk add curl"),
                (StageName::Setup, &format!("echo {}", name)),
            ],
        ));
    }

    let outcomes = Conveyor::new(fixture.context(manifest))
        .build(&[])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.is_success()));
    assert_eq!(fixture.runtime.build_count(), 4);
}

#[tokio::test]
async fn test_failure_is_isolated_per_target() {
    let fixture = Fixture::new();
    fixture.runtime.fail_on_command("make broken");
    let mut manifest = fixture.manifest();
    manifest.images.push(shell_image(
        Some("broken"),
        &[
            (StageName::BeforeInstall, "apk add make"),
            (StageName::Install, "make broken"),
        ],
    ));
    manifest
        .images
        .push(shell_image(Some("ok"), &[(StageName::Install, "echo ok")]));

    let conveyor = Conveyor::new(fixture.context(manifest));
    let outcomes = conveyor.build(&[]).await.unwrap();

    match &outcomes[0].result {
        Err(BuildError::StageFailed { target, stage, .. }) => {
            assert_eq!(target, "broken");
            assert_eq!(*stage, StageName::Install);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(outcomes[1].is_success());

    // 失敗より前のステージはタグ付けされたまま
    let plan = conveyor.plan(&["broken".to_string()]).await.unwrap().remove(0);
    let before_install = plan
        .chain
        .stage_image_name(StageName::BeforeInstall)
        .unwrap();
    assert!(fixture.runtime.has_tag(&before_install));
    assert!(!fixture.runtime.has_tag(&plan.final_image_name()));
}

#[tokio::test]
async fn test_unknown_target() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(shell_image(Some("backend"), &[]));

    let conveyor = Conveyor::new(fixture.context(manifest));
    let err = conveyor.build(&["missing".to_string()]).await.unwrap_err();
    assert!(matches!(err, BuildError::UnknownTarget(name) if name == "missing"));
}

fn artifact(name: &str, command: &str) -> TargetConfig {
    let mut artifact = TargetConfig::artifact(name, "golang:1.23");
    artifact.builder = BuilderConfig::Shell(shell(&[(StageName::Install, command)]));
    artifact
}

fn image_importing(order: &[&str]) -> TargetConfig {
    let mut image = shell_image(None, &[(StageName::Setup, "echo setup")]);
    for name in order {
        image.imports.push(
            ArtifactImport::new(*name, format!("/out/{}", name), ArtifactAnchor::BeforeSetup)
                .with_to(format!("/opt/{}", name)),
        );
    }
    image
}

#[tokio::test]
async fn test_artifact_declaration_order_is_hashed() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.artifacts.insert("a".into(), artifact("a", "go build ./a"));
    manifest.artifacts.insert("b".into(), artifact("b", "go build ./b"));

    let mut forward = manifest.clone();
    forward.images.push(image_importing(&["a", "b"]));
    let mut reversed = manifest;
    reversed.images.push(image_importing(&["b", "a"]));

    let forward = plan_one(&fixture, forward).await;
    let reversed = plan_one(&fixture, reversed).await;

    assert_eq!(
        forward.chain.stage_signature(StageName::Setup),
        reversed.chain.stage_signature(StageName::Setup)
    );
    assert_ne!(
        forward.chain.stage_signature(StageName::BeforeSetupArtifact),
        reversed.chain.stage_signature(StageName::BeforeSetupArtifact)
    );
}

#[tokio::test]
async fn test_artifacts_are_built_before_the_importing_stage() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.artifacts.insert("a".into(), artifact("a", "go build ./a"));
    manifest.images.push(image_importing(&["a"]));

    let conveyor = Conveyor::new(fixture.context(manifest));
    let outcomes = conveyor.build(&[]).await.unwrap();
    assert!(outcomes[0].is_success(), "{:?}", outcomes[0].result);

    let plan = conveyor.plan(&[]).await.unwrap().remove(0);
    let artifact_plan = &plan.artifacts["a"];
    assert!(fixture.runtime.has_tag(&artifact_plan.final_image_name()));

    // アーティファクトからのコピーは run、取り込みは build
    let runs = fixture.runtime.runs();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].1.commands.iter().any(|c| c.contains("/out/a")));
    assert_eq!(fixture.runtime.build_count(), 3);
}

#[tokio::test]
async fn test_cyclic_artifacts_fail_before_building() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    let mut a = artifact("a", "make a");
    a.imports
        .push(ArtifactImport::new("b", "/b", ArtifactAnchor::BeforeInstall));
    let mut b = artifact("b", "make b");
    b.imports
        .push(ArtifactImport::new("a", "/a", ArtifactAnchor::BeforeInstall));
    manifest.artifacts.insert("a".into(), a);
    manifest.artifacts.insert("b".into(), b);
    manifest.images.push(image_importing(&["a"]));

    let conveyor = Conveyor::new(fixture.context(manifest));
    let err = conveyor.plan(&[]).await.unwrap_err();
    assert!(matches!(err, BuildError::CyclicArtifactDependency(_)), "{:?}", err);

    let outcomes = conveyor.build(&[]).await.unwrap();
    assert!(matches!(
        outcomes[0].result,
        Err(BuildError::CyclicArtifactDependency(_))
    ));
    assert_eq!(fixture.runtime.build_count(), 0);
    assert!(fixture.runtime.pulls().is_empty());
}

const COMMIT_A: &str = "c0ffee0000000000000000000000000000000001";
const COMMIT_B: &str = "c0ffee0000000000000000000000000000000002";
const COMMIT_C: &str = "c0ffee0000000000000000000000000000000003";

fn git_image() -> TargetConfig {
    let mut image = shell_image(None, &[(StageName::Install, "bundle install")]);
    image.git.push(GitArtifactConfig::local("/app"));
    image
}

#[tokio::test]
async fn test_new_commit_builds_only_the_latest_patch() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(git_image());

    let first = Conveyor::new(fixture.context(manifest.clone()));
    first.build(&[]).await.unwrap();
    let before = first.plan(&[]).await.unwrap().remove(0);
    assert!(before.chain.stage(StageName::LatestPatch).unwrap().is_empty());
    let builds = fixture.runtime.build_count();

    fixture.vcs.set_head(COMMIT_B);
    fixture.vcs.set_diff(COMMIT_A, COMMIT_B, b"small change");

    let second = Conveyor::new(fixture.context(manifest));
    let outcomes = second.build(&[]).await.unwrap();
    let summary = outcomes[0].result.as_ref().unwrap();
    assert_eq!(summary.built, vec![StageName::LatestPatch]);
    assert_eq!(fixture.runtime.build_count(), builds + 1);

    let after = second.plan(&[]).await.unwrap().remove(0);
    assert_eq!(
        before.chain.stage_signature(StageName::GitArchive),
        after.chain.stage_signature(StageName::GitArchive)
    );
    assert_ne!(before.signature(), after.signature());
}

#[tokio::test]
async fn test_large_diff_hashes_commit_id() {
    let mut fixture = Fixture::new();
    fixture.settings.large_patch_threshold = 16;
    let mut manifest = fixture.manifest();
    manifest.images.push(git_image());
    Conveyor::new(fixture.context(manifest.clone()))
        .build(&[])
        .await
        .unwrap();
    fixture.vcs.set_head(COMMIT_B);

    // しきい値ちょうど：差分の内容で計算し latest_patch に入る
    fixture.vcs.set_diff(COMMIT_A, COMMIT_B, &[b'a'; 16]);
    let small = plan_one(&fixture, manifest.clone()).await;
    assert!(!small.chain.stage(StageName::LatestPatch).unwrap().is_empty());
    assert!(small.chain.stage(StageName::PostSetupPatch).unwrap().is_empty());

    fixture.vcs.set_diff(COMMIT_A, COMMIT_B, &[b'b'; 16]);
    let small_other = plan_one(&fixture, manifest.clone()).await;
    assert_ne!(small.signature(), small_other.signature());

    // しきい値超え：コミットIDで計算し post_setup_patch に入る
    fixture.vcs.set_diff(COMMIT_A, COMMIT_B, &[b'a'; 17]);
    let large = plan_one(&fixture, manifest.clone()).await;
    assert!(!large.chain.stage(StageName::PostSetupPatch).unwrap().is_empty());
    assert!(large.chain.stage(StageName::LatestPatch).unwrap().is_empty());

    fixture.vcs.set_diff(COMMIT_A, COMMIT_B, &[b'b'; 17]);
    let large_other = plan_one(&fixture, manifest).await;
    assert_eq!(large.signature(), large_other.signature());
}

fn git_image_with_dependencies(dependencies: &[(StageName, &str)]) -> TargetConfig {
    let mut image = git_image();
    for (stage, glob) in dependencies {
        image.git[0]
            .stage_dependencies
            .entry(*stage)
            .or_default()
            .push(glob.to_string());
    }
    image
}

async fn build_one(fixture: &Fixture, manifest: layerflow_core::Manifest) -> Vec<StageName> {
    let outcomes = Conveyor::new(fixture.context(manifest)).build(&[]).await.unwrap();
    outcomes[0].result.as_ref().unwrap().built.clone()
}

#[tokio::test]
async fn test_install_is_reused_when_only_app_code_changes_after_gemfile() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(git_image_with_dependencies(&[
        (StageName::Install, "Gemfile"),
        (StageName::Install, "Gemfile.lock"),
    ]));

    fixture.vcs.commit(COMMIT_A, &[("Gemfile", "rails 7"), ("app.rb", "v1")]);
    build_one(&fixture, manifest.clone()).await;

    fixture.vcs.commit(COMMIT_B, &[("Gemfile", "rails 8"), ("app.rb", "v2")]);
    let built = build_one(&fixture, manifest.clone()).await;
    assert!(built.contains(&StageName::PreInstallPatch));
    assert!(built.contains(&StageName::Install));
    let at_b = plan_one(&fixture, manifest.clone()).await;

    fixture.vcs.commit(COMMIT_C, &[("Gemfile", "rails 8"), ("app.rb", "v3")]);
    let at_c = plan_one(&fixture, manifest.clone()).await;
    assert_eq!(
        at_b.chain.stage_signature(StageName::Install),
        at_c.chain.stage_signature(StageName::Install)
    );

    // B で作った pre_install_patch の上に B..C の差分だけを当てる
    let patch = at_c.chain.stage(StageName::LatestPatch).unwrap();
    match patch.kind() {
        layerflow_build::StageKind::GitPatch(patches) => {
            assert_eq!(patches.len(), 1);
            assert_eq!(patches[0].from, COMMIT_B);
            assert_eq!(patches[0].to, COMMIT_C);
        }
        other => panic!("unexpected stage kind: {:?}", other),
    }

    let builds = fixture.runtime.build_count();
    assert_eq!(build_one(&fixture, manifest).await, vec![StageName::LatestPatch]);
    assert_eq!(fixture.runtime.build_count(), builds + 1);
}

#[tokio::test]
async fn test_stage_dependencies_route_to_their_patch_stage() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(git_image_with_dependencies(&[
        (StageName::BeforeSetup, "config/*.yml"),
        (StageName::Setup, "assets"),
    ]));

    fixture.vcs.commit(
        COMMIT_A,
        &[("config/app.yml", "a"), ("assets/app.css", "a"), ("app.rb", "a")],
    );
    build_one(&fixture, manifest.clone()).await;

    // config だけ変更: post_install_patch に入り、残りの差分はない
    fixture.vcs.commit(
        COMMIT_B,
        &[("config/app.yml", "b"), ("assets/app.css", "a"), ("app.rb", "a")],
    );
    let plan = plan_one(&fixture, manifest.clone()).await;
    assert!(!plan.chain.stage(StageName::PostInstallPatch).unwrap().is_empty());
    for stage in [
        StageName::PreInstallPatch,
        StageName::PreSetupPatch,
        StageName::PostSetupPatch,
        StageName::LatestPatch,
    ] {
        assert!(plan.chain.stage(stage).unwrap().is_empty(), "{}", stage);
    }
    assert_eq!(
        build_one(&fixture, manifest.clone()).await,
        vec![StageName::PostInstallPatch]
    );

    // assets だけ変更: post_install_patch は再利用され pre_setup_patch が作られる
    fixture.vcs.commit(
        COMMIT_C,
        &[("config/app.yml", "b"), ("assets/app.css", "c"), ("app.rb", "a")],
    );
    let next = plan_one(&fixture, manifest.clone()).await;
    assert_eq!(
        plan.chain.stage_signature(StageName::PostInstallPatch),
        next.chain.stage_signature(StageName::PostInstallPatch)
    );
    assert!(next.chain.stage(StageName::LatestPatch).unwrap().is_empty());
    assert_eq!(
        build_one(&fixture, manifest).await,
        vec![StageName::PreSetupPatch]
    );
}

#[tokio::test]
async fn test_repin_without_changes_under_include_keeps_signature() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    let mut image = shell_image(None, &[(StageName::Install, "make -C /lib")]);
    let mut lib = GitArtifactConfig::remote(
        "https://git.example.com/org/lib.git",
        Some(GitPin::Commit(COMMIT_A.to_string())),
        "/lib",
    );
    lib.include_paths = vec!["src".to_string()];
    image.git.push(lib);
    manifest.images.push(image);

    fixture.vcs.commit(COMMIT_A, &[("src/lib.c", "1"), ("README", "old")]);
    let before = plan_one(&fixture, manifest.clone()).await;
    build_one(&fixture, manifest.clone()).await;
    let builds = fixture.runtime.build_count();

    // 新しいピンでも include 外の変更だけなら同じイメージ
    let mut repinned = manifest.clone();
    if let layerflow_core::GitRepoRef::Remote { pin, .. } = &mut repinned.images[0].git[0].repo {
        *pin = Some(GitPin::Commit(COMMIT_B.to_string()));
    }
    fixture.vcs.commit(COMMIT_B, &[("src/lib.c", "1"), ("README", "new")]);
    let after = plan_one(&fixture, repinned.clone()).await;

    assert_eq!(signatures(&before), signatures(&after));
    assert!(build_one(&fixture, repinned).await.is_empty());
    assert_eq!(fixture.runtime.build_count(), builds);
}

#[tokio::test]
async fn test_vanished_base_commit_is_reported_at_plan_time() {
    let fixture = Fixture::new();
    let mut manifest = fixture.manifest();
    manifest.images.push(git_image());
    build_one(&fixture, manifest.clone()).await;

    // 履歴の書き換えで A が消えた
    fixture.vcs.set_head(COMMIT_B);
    fixture.vcs.forget(COMMIT_A);

    let err = Conveyor::new(fixture.context(manifest))
        .plan(&[])
        .await
        .unwrap_err();
    match err {
        BuildError::StageFailed { source, .. } => {
            assert!(
                matches!(*source, BuildError::SignatureInputUnavailable(ref message) if message.contains(COMMIT_A)),
                "{:?}",
                source
            );
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

async fn build_failing(introspect_error: bool) -> (Fixture, BuildError) {
    let mut fixture = Fixture::new();
    fixture.settings.introspect_error = introspect_error;
    fixture.runtime.fail_on_command("make broken");
    let mut manifest = fixture.manifest();
    manifest
        .images
        .push(shell_image(None, &[(StageName::Install, "make broken")]));

    let mut outcomes = Conveyor::new(fixture.context(manifest))
        .build(&[])
        .await
        .unwrap();
    let err = outcomes.remove(0).result.unwrap_err();
    (fixture, err)
}

fn kept_container(err: &BuildError) -> Option<String> {
    match err {
        BuildError::StageFailed { source, .. } => match source.as_ref() {
            BuildError::RuntimeCommandFailed(e) => e.introspect_container().map(str::to_string),
            other => panic!("unexpected source: {:?}", other),
        },
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_introspect_error_keeps_failed_container() {
    let (fixture, err) = build_failing(true).await;
    let container = kept_container(&err).expect("container id");

    let containers = fixture
        .runtime
        .containers(&ContainerFilter::default())
        .await
        .unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].id, container);
    assert!(containers[0].names[0].starts_with("layerflow.build.shop."), "{:?}", containers[0].names);
    assert!(err.user_message().contains(&container));
}

#[tokio::test]
async fn test_failed_container_is_removed_without_introspect_error() {
    let (fixture, err) = build_failing(false).await;
    assert_eq!(kept_container(&err), None);
    assert!(
        fixture
            .runtime
            .containers(&ContainerFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}
