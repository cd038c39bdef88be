//! Provider and instance behavior against a scripted engine.

mod common;

use common::{drain, ok, FakeEngine, Scripted};
use local_sandbox::{
    AgentType, CreateOptions, EventKind, ImageSource, LocalConfig, LocalSandboxProvider,
    ReplayPacing, RunOptions, SandboxError, SandboxProvider, GENERIC_IMAGE,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn provider(engine: Arc<FakeEngine>, config: LocalConfig) -> LocalSandboxProvider {
    LocalSandboxProvider::new(config, engine).with_pacing(ReplayPacing::immediate())
}

/// Configuration whose build context is an empty scratch directory.
fn isolated_config(context: &Path) -> LocalConfig {
    LocalConfig {
        build_context: Some(context.to_path_buf()),
        ..Default::default()
    }
}

fn write_definition(root: &Path, agent: &str) {
    let dir = root.join("assets").join("dockerfiles");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("Dockerfile.{}", agent)), "FROM ubuntu:24.04\n").unwrap();
}

#[tokio::test]
async fn registry_image_is_used_when_pull_succeeds() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().script("echo hi", ok("hi\n", "")));
    let provider = provider(engine.clone(), isolated_config(context.path()));

    let sandbox = provider
        .create(CreateOptions::new().agent(AgentType::Claude))
        .await
        .unwrap();
    let result = sandbox.commands().run("echo hi", RunOptions::new()).await.unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(engine.pulls(), vec!["superagent-ai/vibekit-claude:latest"]);
    assert_eq!(engine.execs()[0].image, "superagent-ai/vibekit-claude:latest");
    assert_eq!(sandbox.status().await.image_source, Some(ImageSource::Registry));
}

#[tokio::test]
async fn failed_registry_and_build_fall_back_to_generic_image() {
    let context = tempfile::tempdir().unwrap();
    write_definition(context.path(), "claude");
    let engine = Arc::new(
        FakeEngine::new()
            .failing_pull("superagent-ai/vibekit-claude:latest")
            .failing_builds(),
    );
    let provider = provider(engine.clone(), isolated_config(context.path()));

    let sandbox = provider
        .create(CreateOptions::new().agent("claude"))
        .await
        .unwrap();
    let result = sandbox.run("true", RunOptions::new()).await.unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(
        engine.pulls(),
        vec!["superagent-ai/vibekit-claude:latest", GENERIC_IMAGE]
    );
    assert_eq!(*engine.builds.lock().unwrap(), vec!["vibekit-claude:latest"]);
    assert_eq!(engine.execs()[0].image, GENERIC_IMAGE);

    let status = sandbox.status().await;
    assert_eq!(status.image_source, Some(ImageSource::Fallback));
    assert_eq!(status.base_image.as_deref(), Some(GENERIC_IMAGE));
}

#[tokio::test]
async fn local_build_is_used_and_pushed_when_configured() {
    let context = tempfile::tempdir().unwrap();
    write_definition(context.path(), "codex");
    let config = LocalConfig {
        push_images: true,
        docker_hub_user: Some("alice".to_string()),
        ..isolated_config(context.path())
    };
    let engine = Arc::new(FakeEngine::new().failing_pull("alice/vibekit-codex:latest"));
    let provider = provider(engine.clone(), config);

    let sandbox = provider
        .create(CreateOptions::new().agent("codex"))
        .await
        .unwrap();
    sandbox.run("true", RunOptions::new()).await.unwrap();

    assert_eq!(engine.execs()[0].image, "vibekit-codex:latest");
    assert_eq!(*engine.pushes.lock().unwrap(), vec!["alice/vibekit-codex:latest"]);
    assert_eq!(sandbox.status().await.image_source, Some(ImageSource::Build));
}

#[tokio::test]
async fn unknown_agent_goes_straight_to_generic_image() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().script("echo ok", ok("ok\n", "")));
    let provider = provider(engine.clone(), isolated_config(context.path()));

    let sandbox = provider
        .create(CreateOptions::new().agent("unknown-xyz"))
        .await
        .unwrap();
    let result = sandbox.run("echo ok", RunOptions::new()).await.unwrap();

    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("ok"));
    assert_eq!(engine.pulls(), vec![GENERIC_IMAGE]);
    assert!(sandbox.id().starts_with("local-unknown-xyz-"));
}

#[tokio::test]
async fn exhausted_chain_is_a_sticky_initialization_error() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().failing_every_pull());
    let provider = provider(engine.clone(), isolated_config(context.path()));
    let sandbox = provider
        .create(CreateOptions::new().agent("gemini"))
        .await
        .unwrap();

    let err = sandbox.run("echo hi", RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, SandboxError::Initialization(_)));
    let attempts = engine.pulls().len();

    let again = sandbox.read_file("notes.txt").await.unwrap_err();
    assert!(matches!(again, SandboxError::Initialization(_)));
    assert_eq!(engine.pulls().len(), attempts);
    assert!(engine.execs().is_empty());
}

#[tokio::test]
async fn events_follow_start_stdout_stderr_end() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().script("build", ok("one\n\ntwo\n", "careful\n")));
    let provider = provider(engine, isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();
    let mut rx = sandbox.subscribe();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let result = sandbox
        .run(
            "build",
            RunOptions::new().on_stdout(move |line| sink.lock().unwrap().push(line.to_string())),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "one\n\ntwo\n");
    assert_eq!(result.stderr, "careful\n");
    assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);

    let events = drain(&mut rx);
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Start,
            EventKind::Update,
            EventKind::Update,
            EventKind::Error,
            EventKind::Update,
            EventKind::End,
        ]
    );
    assert_eq!(events[0].json().unwrap()["command"], "build");
    assert_eq!(events[3].payload, "careful");
    assert_eq!(events[4].payload, "STDERR: careful\n");
    assert_eq!(events[5].json().unwrap()["exitCode"], 0);
}

#[tokio::test]
async fn failed_command_reports_exit_code_and_keeps_snapshot() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        FakeEngine::new()
            .script(
                "exit 42",
                Scripted::Fail(
                    "process \"sh -c exit 42\" did not complete successfully: exit code: 42"
                        .to_string(),
                ),
            )
            .script("broken", Scripted::Fail("daemon went away".to_string())),
    );
    let provider = provider(engine, isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();

    sandbox.run("touch a", RunOptions::new()).await.unwrap();
    let before = sandbox.snapshot().await.unwrap();

    let mut rx = sandbox.subscribe();
    let result = sandbox.run("exit 42", RunOptions::new()).await.unwrap();
    assert_eq!(result.exit_code, 42);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.contains("exit code: 42"));

    let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Start, EventKind::Error, EventKind::End]);

    let result = sandbox.run("broken", RunOptions::new()).await.unwrap();
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stderr, "daemon went away");

    let after = sandbox.snapshot().await.unwrap();
    assert_eq!(before.digest(), after.digest());
}

#[tokio::test]
async fn snapshot_is_carried_into_the_next_command() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let provider = provider(engine.clone(), isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();

    sandbox.run("echo one > f.txt", RunOptions::new()).await.unwrap();
    let first = sandbox.snapshot().await.unwrap();
    sandbox.run("cat f.txt", RunOptions::new()).await.unwrap();

    let execs = engine.execs();
    assert_eq!(execs[0].snapshot_digest, None);
    assert_eq!(execs[1].snapshot_digest.as_deref(), Some(first.digest()));
}

#[tokio::test]
async fn background_run_reports_started_even_on_failure() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        FakeEngine::new().script("serve", Scripted::Fail("exit code: 3".to_string())),
    );
    let provider = provider(engine, isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();
    let mut rx = sandbox.subscribe();

    let result = sandbox
        .run("serve", RunOptions::new().background())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "Background process started: serve");
    assert!(result.stderr.is_empty());

    let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Start, EventKind::End]);
}

#[tokio::test]
async fn concurrent_runs_share_one_initialization_and_never_overlap() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        FakeEngine::new()
            .with_pull_delay(Duration::from_millis(30))
            .with_exec_delay(Duration::from_millis(10)),
    );
    let provider = provider(engine.clone(), isolated_config(context.path()));
    let sandbox = Arc::new(provider.create(CreateOptions::new()).await.unwrap());
    let mut rx = sandbox.subscribe();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                sandbox
                    .run(&format!("echo {}", i), RunOptions::new())
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().exit_code, 0);
    }

    assert_eq!(engine.pulls(), vec![GENERIC_IMAGE]);
    assert_eq!(engine.max_concurrent_execs(), 1);

    // Every run after the first sees the snapshot left by its predecessor.
    let execs = engine.execs();
    assert!(execs[0].snapshot_digest.is_none());
    assert!(execs[1..].iter().all(|e| e.snapshot_digest.is_some()));

    let boundaries: Vec<EventKind> = drain(&mut rx)
        .into_iter()
        .map(|e| e.kind)
        .filter(|k| matches!(k, EventKind::Start | EventKind::End))
        .collect();
    assert_eq!(boundaries.len(), 8);
    for pair in boundaries.chunks(2) {
        assert_eq!(pair, [EventKind::Start, EventKind::End]);
    }
}

#[tokio::test]
async fn kill_is_idempotent_and_terminal() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let provider = provider(engine, isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();

    sandbox.run("true", RunOptions::new()).await.unwrap();
    assert!(sandbox.snapshot().await.is_some());

    sandbox.kill().await;
    sandbox.kill().await;
    assert!(!sandbox.is_running());
    assert!(sandbox.snapshot().await.is_none());

    let err = sandbox.run("true", RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, SandboxError::Killed(ref id) if id == sandbox.id()));
    assert!(matches!(
        sandbox.write_file("a.txt", "x").await,
        Err(SandboxError::Killed(_))
    ));
}

#[tokio::test]
async fn calls_queued_behind_kill_never_reach_the_engine() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().with_exec_delay(Duration::from_millis(100)));
    let provider = provider(engine.clone(), isolated_config(context.path()));
    let sandbox = Arc::new(provider.create(CreateOptions::new()).await.unwrap());
    sandbox.run("warmup", RunOptions::new()).await.unwrap();
    let mut rx = sandbox.subscribe();

    let first = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.run("first", RunOptions::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.run("second", RunOptions::new()).await })
    };
    let write = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.write_file("late.txt", "x").await })
    };
    let read = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.read_file("late.txt").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    sandbox.kill().await;

    assert_eq!(first.await.unwrap().unwrap().exit_code, 0);
    assert!(matches!(second.await.unwrap(), Err(SandboxError::Killed(_))));
    assert!(matches!(write.await.unwrap(), Err(SandboxError::Killed(_))));
    assert!(matches!(read.await.unwrap(), Err(SandboxError::Killed(_))));

    let commands: Vec<String> = engine.execs().into_iter().map(|e| e.command).collect();
    assert_eq!(commands, vec!["warmup", "first"]);

    let starts: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == EventKind::Start)
        .map(|e| e.json().unwrap()["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(starts, vec!["first"]);
    assert!(sandbox.snapshot().await.is_none());
}

#[tokio::test]
async fn kill_during_initialization_leaves_no_base_behind() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().with_pull_delay(Duration::from_millis(100)));
    let provider = provider(engine.clone(), isolated_config(context.path()));
    let sandbox = Arc::new(provider.create(CreateOptions::new()).await.unwrap());

    let run = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.run("true", RunOptions::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    sandbox.kill().await;

    assert!(matches!(run.await.unwrap(), Err(SandboxError::Killed(_))));
    let status = sandbox.status().await;
    assert_eq!(status.base_image, None);
    assert_eq!(status.image_source, None);
    assert!(!status.running);
    assert_eq!(engine.pulls(), vec![GENERIC_IMAGE]);
    assert!(engine.execs().is_empty());
}

#[tokio::test]
async fn output_callbacks_see_stdout_lines_then_stderr_lines() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().script("lint", ok("a\n\nb\n", "w1\n  \nw2\n")));
    let provider = provider(engine, isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (out, err) = (seen.clone(), seen.clone());
    let result = sandbox
        .run(
            "lint",
            RunOptions::new()
                .on_stderr(move |line| err.lock().unwrap().push(format!("err:{}", line)))
                .on_stdout(move |line| out.lock().unwrap().push(format!("out:{}", line))),
        )
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["out:a", "out:b", "err:w1", "err:w2"]
    );

    let status = sandbox.status().await;
    assert!(status.snapshot_captured_at.is_some());
}

#[tokio::test]
async fn files_are_layered_through_the_engine() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        FakeEngine::new().script("cat -- 'my notes.txt'", ok("hello", "")),
    );
    let provider = provider(engine.clone(), isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();

    sandbox.write_file("my notes.txt", "hello").await.unwrap();
    let content = sandbox.read_file("/vibe0/my notes.txt").await.unwrap();
    assert_eq!(content, "hello");

    let execs = engine.execs();
    assert_eq!(execs[0].files, vec!["/vibe0/my notes.txt"]);
    assert!(execs[1].snapshot_digest.is_some());

    assert!(matches!(
        sandbox.read_file("../etc/passwd").await,
        Err(SandboxError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn read_failure_is_an_execution_error() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().script(
        "cat -- missing.txt",
        Scripted::Fail("exit code: 1".to_string()),
    ));
    let provider = provider(engine, isolated_config(context.path()));
    let sandbox = provider.create(CreateOptions::new()).await.unwrap();

    assert!(matches!(
        sandbox.read_file("missing.txt").await,
        Err(SandboxError::Execution(_))
    ));
}

#[tokio::test]
async fn resume_returns_a_fresh_instance_and_list_is_empty() {
    let context = tempfile::tempdir().unwrap();
    let provider = provider(Arc::new(FakeEngine::new()), isolated_config(context.path()));

    let original = provider
        .create(CreateOptions::new().agent("claude").env("FOO", "bar"))
        .await
        .unwrap();
    let resumed = provider.resume(original.id()).await.unwrap();

    assert_ne!(resumed.id(), original.id());
    assert!(resumed.id().starts_with("local-default-"));
    assert!(resumed.envs().is_empty());
    assert_eq!(resumed.working_dir(), "/vibe0");
    assert!(provider.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn instance_surface_defaults() {
    let context = tempfile::tempdir().unwrap();
    let provider = provider(Arc::new(FakeEngine::new()), isolated_config(context.path()));
    let sandbox = provider
        .create(CreateOptions::new().working_dir("/workspace"))
        .await
        .unwrap();

    sandbox.pause().await;
    assert!(sandbox.is_running());
    assert_eq!(sandbox.get_host(3000).await, "localhost");
    assert_eq!(sandbox.working_dir(), "/workspace");

    assert!(matches!(
        provider.create(CreateOptions::new().working_dir("/")).await,
        Err(SandboxError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn reload_affects_only_new_instances() {
    let context = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let provider = provider(engine.clone(), isolated_config(context.path()));
    let before = provider
        .create(CreateOptions::new().agent("claude"))
        .await
        .unwrap();

    let path = context.path().join(".vibekit-config.json");
    std::fs::write(&path, r#"{ "dockerHubUser": "carol" }"#).unwrap();
    let reloaded = provider.reload(&path);
    assert_eq!(reloaded.docker_hub_user.as_deref(), Some("carol"));

    let after = provider
        .create(CreateOptions::new().agent("claude"))
        .await
        .unwrap();
    before.run("true", RunOptions::new()).await.unwrap();
    after.run("true", RunOptions::new()).await.unwrap();

    assert_eq!(
        engine.pulls(),
        vec![
            "superagent-ai/vibekit-claude:latest",
            "carol/vibekit-claude:latest"
        ]
    );
}
