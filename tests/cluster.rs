//! End-to-end tests that fork a real cluster through the binary and talk
//! to it over the balancer's public port.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tokio::{process::Child, process::Command, time::sleep};

const READY_TIMEOUT: Duration = Duration::from_secs(20);
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

fn reserve_port() -> Result<u16> {
    // Bind-then-drop gives a port that was just free; the regular workers
    // take the ports immediately above it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn spawn_cluster(port: u16, workers: u32) -> Result<Child> {
    let binary = assert_cmd::cargo::cargo_bin!("user-cluster");
    let child = Command::new(binary)
        .arg("serve")
        .arg("--port")
        .arg(port.to_string())
        .arg("--workers")
        .arg(workers.to_string())
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn cluster primary")?;
    Ok(child)
}

fn quick_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("failed to build client")
}

/// Polls the public port until the balancer and at least one request
/// worker are serving, i.e. the whole forked topology came up.
async fn wait_until_ready(client: &reqwest::Client, base: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    loop {
        if let Ok(response) = client.get(base).send().await {
            if response.status() == 200 {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("cluster did not become ready in time"));
        }
        sleep(RETRY_INTERVAL).await;
    }
}

#[tokio::test]
async fn crud_scenario_through_the_balancer() -> Result<()> {
    let port = reserve_port()?;
    let mut primary = spawn_cluster(port, 3)?;
    let client = quick_client()?;
    let base = format!("http://127.0.0.1:{port}/api/users");

    wait_until_ready(&client, &base).await?;

    // Fresh cluster starts empty.
    let users: Vec<Value> = client.get(&base).send().await?.json().await?;
    assert_eq!(users, Vec::<Value>::new());

    // Create Leo.
    let response = client
        .post(&base)
        .json(&json!({ "username": "Leo", "age": 30, "hobbies": ["js"] }))
        .send()
        .await?;
    assert_eq!(response.status(), 201);
    let created: Value = response.json().await?;
    assert_eq!(created["username"], "Leo");
    assert_eq!(created["age"], 30);
    assert_eq!(created["hobbies"], json!(["js"]));
    let id = created["id"].as_str().context("created user has an id")?;
    uuid::Uuid::parse_str(id).context("assigned id is a uuid")?;

    // Reads go through different request workers yet see the same store.
    // Several consecutive requests walk the whole round-robin ring.
    for _ in 0..4 {
        let response = client.get(format!("{base}/{id}")).send().await?;
        assert_eq!(response.status(), 200);
        assert_eq!(response.json::<Value>().await?, created);
    }

    // Update.
    let response = client
        .put(format!("{base}/{id}"))
        .json(&json!({ "username": "Leo", "age": 31, "hobbies": ["js"] }))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await?["age"], 31);

    // Delete once: 204 with an empty body.
    let response = client.delete(format!("{base}/{id}")).send().await?;
    assert_eq!(response.status(), 204);
    assert!(response.bytes().await?.is_empty());

    // The id is gone now.
    let response = client.get(format!("{base}/{id}")).send().await?;
    assert_eq!(response.status(), 404);
    assert_eq!(
        response.json::<Value>().await?,
        json!({ "message": "User not found" })
    );

    // Deleting again is a 404, not an error.
    let response = client.delete(format!("{base}/{id}")).send().await?;
    assert_eq!(response.status(), 404);

    // Bad inputs are answered at the edge.
    let response = client.get(format!("{base}/not-a-uuid")).send().await?;
    assert_eq!(response.status(), 400);
    let response = client.get(format!("http://127.0.0.1:{port}/nope")).send().await?;
    assert_eq!(response.status(), 404);

    primary.kill().await.ok();
    Ok(())
}

/// The pids of the primary's direct children holding the given fork-time
/// role, discovered through their environment.
fn children_with_role(primary_pid: u32, role: &str) -> Vec<u32> {
    let sys = sysinfo::System::new_all();
    let marker = format!("USER_CLUSTER_ROLE={role}");
    sys.processes()
        .iter()
        .filter(|(_, process)| {
            process.parent().map(|p| p.as_u32()) == Some(primary_pid)
                && process.environ().iter().any(|kv| *kv == marker)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

fn kill_process(pid: u32) -> Result<()> {
    let sys = sysinfo::System::new_all();
    let process = sys
        .process(sysinfo::Pid::from_u32(pid))
        .context("process to kill not found")?;
    process.kill();
    Ok(())
}

#[tokio::test]
async fn db_worker_death_is_survived_by_respawn() -> Result<()> {
    let port = reserve_port()?;
    let mut primary = spawn_cluster(port, 3)?;
    let client = quick_client()?;
    let base = format!("http://127.0.0.1:{port}/api/users");

    wait_until_ready(&client, &base).await?;
    let primary_pid = primary.id().context("primary has a pid")?;

    // Exactly one DB worker before the crash.
    let before = children_with_role(primary_pid, "db");
    assert_eq!(before.len(), 1, "expected exactly one db worker");
    kill_process(before[0])?;

    // Creates lost in the crash window are expected; liveness means a
    // later create succeeds against the respawned DB worker.
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    let created = loop {
        let attempt = client
            .post(&base)
            .json(&json!({ "username": "Survivor", "age": 1, "hobbies": [] }))
            .send()
            .await;
        if let Ok(response) = attempt {
            if response.status() == 201 {
                break response.json::<Value>().await?;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("cluster never recovered after db worker death"));
        }
        sleep(RETRY_INTERVAL).await;
    };
    assert_eq!(created["username"], "Survivor");

    // Exactly one DB worker afterwards, and it is a new process.
    let after = children_with_role(primary_pid, "db");
    assert_eq!(after.len(), 1, "expected exactly one respawned db worker");
    assert_ne!(after[0], before[0], "db worker should be a fresh process");

    primary.kill().await.ok();
    Ok(())
}
