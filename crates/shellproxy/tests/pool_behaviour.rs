// End-to-end behaviour of CommandProxyPool against a real /bin/sh.
// Commands that write to stderr sleep briefly afterwards: the two streams are
// read independently, so stderr must land before the sentinel on stdout.

#![cfg(unix)]

use shellproxy::{CommandProxyPool, Lifecycle, ProxyError};
use shellproxy_core::config::{InvalidationPatterns, PoolConfig};
use shellproxy_core::{PatternSpec, ShellProxyConfig};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ShellProxyConfig {
    ShellProxyConfig::default()
}

fn patterns(list: &[&str]) -> Vec<PatternSpec> {
    list.iter().map(|p| PatternSpec::new(*p)).collect()
}

fn temp_marker(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("shellproxy-{label}-{}", uuid::Uuid::new_v4()))
}

/// Poll until `check` holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn batch_results_are_ordered_and_state_persists() {
    let pool = CommandProxyPool::new(config()).await;

    let commands = ["export MY_VAR=fourty-two", "echo $MY_VAR", "cd /", "pwd"];
    let results = pool.execute_commands(&commands).await.unwrap();
    assert_eq!(results.len(), commands.len());
    for (result, command) in results.iter().zip(commands) {
        assert_eq!(result.command, command);
    }
    assert_eq!(results[1].stdout, "fourty-two");
    assert_eq!(results[3].stdout, "/");

    // Same single process, so the shell state carries over between batches.
    let again = pool.execute_command("echo $MY_VAR; pwd").await.unwrap();
    assert_eq!(again.stdout, "fourty-two\n/");

    pool.shutdown().await;
}

#[tokio::test]
async fn multi_line_output_is_trimmed_but_kept_whole() {
    let pool = CommandProxyPool::new(config()).await;
    let result = pool
        .execute_command("printf '\\n\\n  one\\ntwo  \\n\\n'")
        .await
        .unwrap();
    assert_eq!(result.stdout, "one\ntwo");
    pool.shutdown().await;
}

#[tokio::test]
async fn blacklisted_command_is_rejected_and_never_written() {
    let pool = CommandProxyPool::new(ShellProxyConfig {
        blacklist: patterns(&[".*blacklisted.*"]),
        ..config()
    })
    .await;
    let before = pool.pool_stats();
    let marker = temp_marker("blacklist");

    let command = format!("touch {} # some blacklisted command", marker.display());
    let err = pool
        .execute_commands(&["echo fine", command.as_str()])
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::Blacklisted { .. }));
    assert!(err.to_string().contains("blacklisted"));
    assert!(err.to_string().contains(&command));
    assert!(!marker.exists());

    // The borrowed process came straight back.
    assert_eq!(pool.pool_stats().idle, before.idle);
    assert_eq!(pool.pool_stats().borrowed, 0);
    assert!(pool.get_status()[0].active_commands.is_empty());

    pool.shutdown().await;
}

#[tokio::test]
async fn non_whitelisted_command_is_rejected() {
    let pool = CommandProxyPool::new(ShellProxyConfig {
        whitelist: patterns(&[".*whitelisted.*"]),
        ..config()
    })
    .await;

    let ok = pool.execute_command("echo whitelisted").await.unwrap();
    assert_eq!(ok.stdout, "whitelisted");

    let err = pool.execute_command("echo something else").await.unwrap_err();
    assert_eq!(err.code(), "NOT_WHITELISTED");
    assert!(err.to_string().contains("whitelisted"));
    assert!(err.to_string().contains("echo something else"));
    assert_eq!(pool.pool_stats().idle, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn stderr_match_invalidates_for_good() {
    let pool = CommandProxyPool::new(ShellProxyConfig {
        invalidate_on: InvalidationPatterns {
            stderr: patterns(&[".*nomatch.*"]),
            ..Default::default()
        },
        ..config()
    })
    .await;

    let lease = pool.acquire().await.unwrap();
    let pid = lease.pid();

    // On stdout the pattern is ignored.
    lease.execute_command("echo nomatch").await.unwrap();
    assert!(lease.is_valid());

    let result = lease
        .execute_command("echo 'this nomatch here' >&2; sleep 0.2")
        .await
        .unwrap();
    assert_eq!(result.stderr, "this nomatch here");
    assert!(!lease.is_valid());

    lease.execute_command("echo still here").await.unwrap();
    assert!(!lease.is_valid());

    // Returning it destroys it and the pool refills to min.
    pool.release(lease);
    assert!(eventually(|| pool.process(pid).is_none()).await);
    assert!(eventually(|| pool.pool_stats().idle == 1).await);
    assert_ne!(pool.get_status()[0].pid, pid);

    pool.shutdown().await;
}

#[tokio::test]
async fn history_keeps_only_the_most_recent_commands() {
    let pool = CommandProxyPool::new(ShellProxyConfig {
        retain_max_cmd_history: 2,
        ..config()
    })
    .await;

    for i in 1..=5 {
        pool.execute_command(&format!("echo {i}")).await.unwrap();
    }

    let status = pool.get_status();
    let history = &status[0].command_history;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].command, "echo 4");
    assert_eq!(history[1].command, "echo 5");
    assert_eq!(history[1].stdout.as_deref(), Some("5"));
    assert!(history.iter().all(|c| c.finished));

    pool.shutdown().await;
}

#[tokio::test]
async fn probe_invalidates_without_any_submitted_command() {
    let config = ShellProxyConfig::from_toml_str(
        r#"
        [auto_invalidation]
        check_interval_ms = 100

        [[auto_invalidation.commands]]
        command = "echo unhealthy"

        [[auto_invalidation.commands.regexes.stdout]]
        regex = "unhealthy"
        invalid_on = "match"
        "#,
    )
    .unwrap();
    let pool = CommandProxyPool::new(config).await;

    let pid = pool.get_status()[0].pid;
    let proxy = pool.process(pid).unwrap();
    assert!(proxy.is_valid());
    assert!(eventually(|| !proxy.is_valid()).await);

    pool.shutdown().await;
}

#[tokio::test]
async fn healthy_probe_leaves_process_valid() {
    let config = ShellProxyConfig::from_toml_str(
        r#"
        [auto_invalidation]
        check_interval_ms = 50

        [[auto_invalidation.commands]]
        command = "cd /"

        [[auto_invalidation.commands]]
        command = "pwd"

        [[auto_invalidation.commands.regexes.stdout]]
        regex = "^/$"
        invalid_on = "noMatch"
        "#,
    )
    .unwrap();
    let pool = CommandProxyPool::new(config).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(pool.get_status()[0].is_valid);
    // Probe batches and caller batches share one queue without mixing up.
    let result = pool.execute_command("echo caller").await.unwrap();
    assert_eq!(result.stdout, "caller");

    pool.shutdown().await;
}

#[tokio::test]
async fn init_and_pre_destroy_commands_run_unchecked() {
    let marker = temp_marker("pre-destroy");
    let pool = CommandProxyPool::new(ShellProxyConfig {
        // Init and pre-destroy commands bypass the whitelist.
        whitelist: patterns(&["^echo "]),
        init_commands: vec!["export FROM_INIT=yes".into()],
        pre_destroy_commands: vec![format!("touch {}", marker.display())],
        ..config()
    })
    .await;

    let result = pool.execute_command("echo $FROM_INIT").await.unwrap();
    assert_eq!(result.stdout, "yes");
    assert!(!marker.exists());

    pool.shutdown().await;
    assert!(marker.exists());
    let _ = std::fs::remove_file(&marker);
}

#[tokio::test]
async fn status_reports_in_flight_and_finished_commands() {
    let pool = Arc::new(
        CommandProxyPool::new(ShellProxyConfig {
            retain_max_cmd_history: 5,
            ..config()
        })
        .await,
    );
    pool.execute_command("echo first").await.unwrap();
    let pid = pool.get_status()[0].pid;

    let slow = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_command("sleep 0.4; echo slow").await })
    };
    let proxy = pool.process(pid).unwrap();
    assert!(eventually(|| !proxy.active_commands().is_empty()).await);

    let status = proxy.status();
    assert_eq!(status.pid, pid);
    assert_eq!(status.process, "/bin/sh");
    assert_eq!(status.lifecycle, Lifecycle::Ready);
    assert_eq!(status.active_commands.len(), 1);
    assert!(!status.active_commands[0].finished);
    assert!(status.active_commands[0].stdout.is_none());
    assert_eq!(status.command_history[0].command, "echo first");

    let json = serde_json::to_value(&status).unwrap();
    assert!(json.get("status_time").is_some());
    assert_eq!(json["is_valid"], true);

    assert_eq!(slow.await.unwrap().unwrap().stdout, "slow");
    assert!(proxy.active_commands().is_empty());
    assert_eq!(proxy.command_history().len(), 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn killed_process_fails_the_batch_and_is_replaced() {
    let pool = CommandProxyPool::new(config()).await;
    let pid = pool.get_status()[0].pid;

    let err = pool.execute_command("kill -9 $$").await.unwrap_err();
    assert_eq!(err.code(), "PROCESS_EXITED");

    assert!(eventually(|| pool.process(pid).is_none()).await);
    let result = pool.execute_command("echo back").await.unwrap();
    assert_eq!(result.stdout, "back");
    assert_ne!(pool.get_status()[0].pid, pid);

    pool.shutdown().await;
}

#[tokio::test]
async fn concurrent_batches_use_separate_processes_up_to_max() {
    let pool = CommandProxyPool::new(ShellProxyConfig {
        pool: PoolConfig {
            min: 1,
            max: 2,
            ..Default::default()
        },
        ..config()
    })
    .await;

    let (a, b, c) = tokio::join!(
        pool.execute_command("sleep 0.2; echo $$"),
        pool.execute_command("sleep 0.2; echo $$"),
        pool.execute_command("echo $$"),
    );
    let pids = [a.unwrap().stdout, b.unwrap().stdout, c.unwrap().stdout];
    assert_ne!(pids[0], pids[1]);
    assert!(pids[2] == pids[0] || pids[2] == pids[1]);
    assert_eq!(pool.pool_stats().size, 2);

    pool.shutdown().await;
    assert_eq!(pool.pool_stats().size, 0);
    assert!(matches!(
        pool.execute_command("echo late").await,
        Err(ProxyError::PoolDraining)
    ));
}
