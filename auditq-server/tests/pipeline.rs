use std::{sync::Arc, time::Duration};

use anyhow::Result;
use auditq_core::{
    AuditContext, AuditId, AuditPipeline, NewJob, SystemClock, TenantId,
    events::{MemoryEventStore, ProgressRecorder},
    store::{JobStore, MemoryJobStore},
};
use auditq_server::pipeline::HttpAuditPipeline;
use axum::{Json, Router, http::StatusCode, routing::post};
use serde_json::{Value, json};

/// Local stand-in for the audit executor.
async fn spawn_executor() -> Result<String> {
    let router = Router::new()
        .route(
            "/ok",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "echo_attempt": body["attempt"],
                    "echo_url": body["payload"]["url"],
                    "job_id": body["job_id"],
                }))
            }),
        )
        .route(
            "/reject",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "unsupported site") }),
        )
        .route(
            "/flaky",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
        )
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, router).await });
    Ok(format!("http://{addr}"))
}

async fn context() -> Result<AuditContext> {
    let clock = SystemClock::shared();
    let store = MemoryJobStore::new(clock.clone());
    store
        .create(NewJob::new(
            TenantId::new(),
            AuditId::new(),
            json!({ "url": "https://site.example" }),
            "pipeline-test",
        ))
        .await?;
    let job = store
        .claim_next("w1", Duration::from_secs(60))
        .await?
        .expect("claimable job");
    let recorder = ProgressRecorder::new(Arc::new(MemoryEventStore::new(clock)));
    Ok(AuditContext::new(&job, recorder))
}

#[tokio::test]
async fn executor_response_maps_to_outcomes() -> Result<()> {
    let base = spawn_executor().await?;
    let ctx = context().await?;
    let payload = json!({ "url": "https://site.example" });

    let ok = HttpAuditPipeline::new(format!("{base}/ok"), Duration::from_secs(5))?;
    let result = ok.execute(&ctx, &payload).await?;
    assert_eq!(result["echo_attempt"], 1);
    assert_eq!(result["echo_url"], "https://site.example");
    assert_eq!(result["job_id"], json!(ctx.job_id));

    let reject = HttpAuditPipeline::new(format!("{base}/reject"), Duration::from_secs(5))?;
    let err = reject.execute(&ctx, &payload).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.message().contains("unsupported site"));

    let flaky = HttpAuditPipeline::new(format!("{base}/flaky"), Duration::from_secs(5))?;
    assert!(flaky.execute(&ctx, &payload).await.unwrap_err().is_retryable());
    Ok(())
}

#[tokio::test]
async fn timeouts_and_unreachable_executors_are_retryable() -> Result<()> {
    let base = spawn_executor().await?;
    let ctx = context().await?;

    let slow = HttpAuditPipeline::new(format!("{base}/slow"), Duration::from_millis(200))?;
    let err = slow.execute(&ctx, &json!({})).await.unwrap_err();
    assert!(err.is_retryable());

    // Port 9 (discard) on localhost is closed in test environments.
    let gone = HttpAuditPipeline::new("http://127.0.0.1:9/run", Duration::from_secs(2))?;
    assert!(gone.execute(&ctx, &json!({})).await.unwrap_err().is_retryable());
    Ok(())
}
