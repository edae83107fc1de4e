mod common;

use common::{
    FakeBackend, NO_KEYS, TestGateway, TestOptions, eventually, initialize_request, open_session,
    post,
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::time::{Duration, Instant};

fn namespace() -> Vec<FakeBackend> {
    vec![
        FakeBackend::new("B1").tools(&["x"]),
        FakeBackend::new("B2").tools(&["y"]),
    ]
}

#[tokio::test]
async fn warm_pool_serves_sessions_without_sharing_instances() -> anyhow::Result<()> {
    let gw = TestGateway::start(
        &[("N1", namespace())],
        &[("ep", "N1", NO_KEYS)],
        TestOptions {
            pool_depth: 1,
            ..TestOptions::default()
        },
    )
    .await?;
    gw.pool.warm(&["N1".to_string()]);
    assert!(eventually(Duration::from_secs(2), || gw.pool.idle_count("N1") == 1).await);

    let client = reqwest::Client::new();
    let url = gw.url("ep");
    let sessions = futures::future::try_join_all((0..4).map(|_| open_session(&client, &url))).await?;
    assert_eq!(sessions.iter().collect::<HashSet<_>>().len(), 4);

    let mut seen_instances = HashSet::new();
    let mut seen_handles = HashSet::new();
    for session_id in &sessions {
        let session = gw.registry.lookup(session_id)?;
        let aggregator = session.transport().aggregator();
        assert!(seen_instances.insert(aggregator.instance_id()));
        for handle in aggregator.handle_ids() {
            assert!(seen_handles.insert(handle), "handle {handle} shared");
        }
    }

    let snapshot = gw.pool.snapshot();
    assert!(snapshot.hits >= 1);
    assert_eq!(snapshot.hits + snapshot.misses, 4);

    // The pool refills after handing instances out.
    assert!(eventually(Duration::from_secs(2), || gw.pool.idle_count("N1") == 1).await);

    gw.stop().await;
    assert_eq!(gw.pool.idle_count("N1"), 0);
    assert!(gw.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn stale_pooled_instances_are_evicted_and_replaced() -> anyhow::Result<()> {
    let gw = TestGateway::start(
        &[("N1", namespace())],
        &[("ep", "N1", NO_KEYS)],
        TestOptions {
            pool_depth: 1,
            max_idle_age: Duration::from_millis(100),
            ..TestOptions::default()
        },
    )
    .await?;
    gw.pool.warm(&["N1".to_string()]);
    assert!(eventually(Duration::from_secs(2), || gw.pool.idle_count("N1") == 1).await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(gw.pool.evict_stale().await, 1);
    assert_eq!(gw.connector.stats.closes(), 2);
    assert!(eventually(Duration::from_secs(2), || gw.pool.idle_count("N1") == 1).await);
    assert_eq!(gw.pool.snapshot().evictions, 1);

    gw.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_cold_starts_finish_within_startup_bound() -> anyhow::Result<()> {
    let startup_timeout = Duration::from_millis(200);
    let gw = TestGateway::start(
        &[(
            "N1",
            vec![FakeBackend::new("B1").tools(&["x"]).connect_delay(Duration::from_secs(3))],
        )],
        &[("ep", "N1", NO_KEYS)],
        TestOptions {
            pool_depth: 1,
            startup_timeout,
            ..TestOptions::default()
        },
    )
    .await?;
    let client = reqwest::Client::new();
    let url = gw.url("ep");

    let attempts = (0..4).map(|i| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let started = Instant::now();
            let resp = post(&client, &url, None, &initialize_request(i)).await?;
            let body: Value = resp.json().await?;
            anyhow::Ok((started.elapsed(), body))
        }
    });
    for (elapsed, body) in futures::future::try_join_all(attempts).await? {
        // Per-backend startup timeout, plus the cold-build grace and scheduling slack.
        assert!(
            elapsed < startup_timeout + Duration::from_millis(1000),
            "first POST took {elapsed:?}"
        );
        assert_eq!(body["error"], json!("BackendUnavailable"));
    }
    assert!(gw.registry.is_empty());

    gw.stop().await;
    Ok(())
}

#[tokio::test]
async fn slow_teardown_of_stale_pooled_instance_does_not_delay_new_session() -> anyhow::Result<()> {
    let gw = TestGateway::start(
        &[(
            "N1",
            vec![FakeBackend::new("B1").tools(&["x"]).slow_close(Duration::from_secs(3))],
        )],
        &[("ep", "N1", NO_KEYS)],
        TestOptions {
            pool_depth: 1,
            max_idle_age: Duration::from_millis(100),
            ..TestOptions::default()
        },
    )
    .await?;
    gw.pool.warm(&["N1".to_string()]);
    assert!(eventually(Duration::from_secs(2), || gw.pool.idle_count("N1") == 1).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let client = reqwest::Client::new();
    let started = Instant::now();
    open_session(&client, &gw.url("ep")).await?;
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(1), "session open took {elapsed:?}");
    assert_eq!(gw.pool.snapshot().evictions, 1);

    // Teardown of every handle takes seconds here; only stop accepting work.
    gw.shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn replenish_failures_are_retried_and_never_surface() -> anyhow::Result<()> {
    let gw = TestGateway::start(
        &[("N1", vec![FakeBackend::new("B1").failing()])],
        &[("ep", "N1", NO_KEYS)],
        TestOptions {
            pool_depth: 1,
            ..TestOptions::default()
        },
    )
    .await?;
    gw.pool.warm(&["N1".to_string()]);
    assert!(
        eventually(Duration::from_secs(2), || gw.pool.snapshot().replenish_failures >= 2).await
    );
    assert_eq!(gw.pool.idle_count("N1"), 0);

    gw.stop().await;
    Ok(())
}

#[tokio::test]
async fn admin_surface_lists_live_sessions() -> anyhow::Result<()> {
    let gw = TestGateway::start(
        &[("N1", namespace()), ("N2", vec![FakeBackend::new("C1").tools(&["z"])])],
        &[("ep", "N1", NO_KEYS), ("other", "N2", NO_KEYS)],
        TestOptions {
            admin_token: Some("admin-secret".to_string()),
            ..TestOptions::default()
        },
    )
    .await?;
    let client = reqwest::Client::new();
    let first = open_session(&client, &gw.url("ep")).await?;
    let second = open_session(&client, &gw.url("other")).await?;

    let health: Value = client
        .get(format!("{}/health", gw.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health, json!({ "status": "ok" }));

    let resp = client
        .get(format!("{}/admin/sessions", gw.base))
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    for wrong in ["admin-secreT", "admin", "admin-secret-and-more"] {
        let resp = client
            .get(format!("{}/admin/status", gw.base))
            .bearer_auth(wrong)
            .send()
            .await?;
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED, "token {wrong}");
    }

    let all: Value = client
        .get(format!("{}/admin/sessions", gw.base))
        .bearer_auth("admin-secret")
        .send()
        .await?
        .json()
        .await?;
    let ids: HashSet<&str> = all["sessions"]
        .as_array()
        .map(|s| s.iter().filter_map(|s| s["sessionId"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(ids, HashSet::from([first.as_str(), second.as_str()]));

    let filtered: Value = client
        .get(format!("{}/admin/sessions?namespace=N2", gw.base))
        .bearer_auth("admin-secret")
        .send()
        .await?
        .json()
        .await?;
    let sessions = filtered["sessions"].as_array().cloned().unwrap_or_default();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], json!(second));
    assert_eq!(sessions[0]["namespace"], json!("N2"));
    assert_eq!(sessions[0]["endpoint"], json!("other"));
    assert!(sessions[0]["createdAt"].is_string());
    assert!(sessions[0]["lastActivityAt"].is_string());
    assert_eq!(sessions[0]["backends"][0]["state"], json!("ready"));

    let status: Value = client
        .get(format!("{}/admin/status", gw.base))
        .bearer_auth("admin-secret")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["sessionCount"], json!(2));
    assert!(status["pool"]["namespaces"].is_array());

    let pool: Value = client
        .get(format!("{}/admin/pool", gw.base))
        .bearer_auth("admin-secret")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(pool["misses"], json!(2));

    gw.stop().await;
    Ok(())
}
