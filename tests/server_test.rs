//! Integration tests for the water-usage HTTP server

#[cfg(feature = "server")]
mod server_tests {
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use water_usage_agent::diagnostics::create_shared_log;
    use water_usage_agent::server::{run, ServerConfig};
    use water_usage_agent::{ClassifierAdapter, SegmenterConfig, WaterUsageEngine};

    async fn start_server() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let engine = Arc::new(WaterUsageEngine::new(
            SegmenterConfig::default(),
            ClassifierAdapter::local(Duration::from_secs(1)),
            create_shared_log(),
            chrono_tz::UTC,
        ));
        let config = ServerConfig {
            port: 0,
            persist: false,
        };

        let (addr, shutdown_tx) = run(config, engine).await.expect("Failed to start server");

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;
        (addr, shutdown_tx)
    }

    fn readings() -> Value {
        json!([
            { "timestamp": "2024-03-01T07:00:00Z", "value": 0 },
            { "timestamp": "2024-03-01T07:01:00Z", "value": 500 },
            { "timestamp": "2024-03-01T07:02:00Z", "value": 600 },
            { "timestamp": "2024-03-01T07:03:00Z", "value": 550 },
            { "timestamp": "2024-03-01T07:04:00Z", "value": 0 }
        ])
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, shutdown_tx) = start_server().await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .expect("Failed to send request");

        assert!(response.status().is_success());

        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["status"], "ok");
        assert!(body["version"].as_str().is_some());
        assert_eq!(body["classifier"], "rules");

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_ingest_then_query_usage() {
        let (addr, shutdown_tx) = start_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{}/api/water/readings?meterId=house-1", addr))
            .json(&readings())
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());

        let body: Value = response.json().await.expect("Failed to parse JSON");
        let outcomes = body["outcomes"].as_array().expect("outcomes array");
        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes[1]["status"], "opened");
        assert_eq!(outcomes[4]["status"], "event_closed");
        assert_eq!(outcomes[4]["event"]["volumeMl"], 1650);

        let response = client
            .get(format!(
                "http://{}/api/water/usage?meterId=house-1&timeRange=day&startDate=2024-03-01T00:00:00Z&endDate=2024-03-02T00:00:00Z",
                addr
            ))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());

        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["totalUsageMl"], 1650);
        assert_eq!(body["eventCount"], 1);
        assert_eq!(body["timeRange"], "day");
        assert!(body["recommendations"].as_array().is_some());

        let response = client
            .get(format!("http://{}/api/water/events/1", addr))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_event_edits() {
        let (addr, shutdown_tx) = start_server().await;
        let client = reqwest::Client::new();

        client
            .post(format!("http://{}/api/water/readings?meterId=house-1", addr))
            .json(&readings())
            .send()
            .await
            .expect("Failed to send request");

        let response = client
            .patch(format!("http://{}/api/water/events/1/categorize", addr))
            .json(&json!({ "category": "faucet" }))
            .send()
            .await
            .expect("Failed to send request");
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["category"], "faucet");
        assert_eq!(body["confidence"], 100);

        let response = client
            .patch(format!("http://{}/api/water/events/1/flag", addr))
            .json(&json!({ "isAnomaly": true, "reason": "Dripping tap" }))
            .send()
            .await
            .expect("Failed to send request");
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["anomaly"], true);
        assert_eq!(body["anomalyDescription"], "Dripping tap");

        let response = client
            .post(format!("http://{}/api/ai/analyze-chain", addr))
            .json(&json!({ "eventIds": [1] }))
            .send()
            .await
            .expect("Failed to send request");
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["isChain"], false);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_error_responses() {
        let (addr, shutdown_tx) = start_server().await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{}/api/water/usage?meterId=nobody&timeRange=day", addr))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["code"], "UNKNOWN_METER");

        client
            .post(format!("http://{}/api/water/readings?meterId=house-1", addr))
            .json(&readings())
            .send()
            .await
            .expect("Failed to send request");

        let response = client
            .get(format!(
                "http://{}/api/water/usage?meterId=house-1&startDate=2024-03-02T00:00:00Z&endDate=2024-03-01T00:00:00Z",
                addr
            ))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["code"], "INVALID_TIME_WINDOW");

        let response = client
            .get(format!("http://{}/api/water/usage?timeRange=day", addr))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = client
            .get(format!("http://{}/api/water/events/42", addr))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_settings_roundtrip_and_delete() {
        let (addr, shutdown_tx) = start_server().await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{}/api/settings?meterId=house-1", addr))
            .send()
            .await
            .expect("Failed to send request");
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["dataRetention"], 90);
        assert_eq!(body["allowAiAnalysis"], true);

        let response = client
            .put(format!("http://{}/api/settings?meterId=house-1", addr))
            .json(&json!({ "dataRetention": 30, "shareWithUtility": true }))
            .send()
            .await
            .expect("Failed to send request");
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["dataRetention"], 30);
        assert_eq!(body["shareWithUtility"], true);
        assert_eq!(body["storeRawData"], true);

        let response = client
            .post(format!("http://{}/api/settings/reset?meterId=house-1", addr))
            .send()
            .await
            .expect("Failed to send request");
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["dataRetention"], 90);

        let response = client
            .delete(format!("http://{}/api/user/data?meterId=house-1", addr))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());
        let body: Value = response.json().await.expect("Failed to parse JSON");
        assert!(body["message"].as_str().is_some());

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_cors_allows_localhost() {
        let (addr, shutdown_tx) = start_server().await;

        let client = reqwest::Client::new();
        let response = client
            .request(reqwest::Method::OPTIONS, format!("http://{}/health", addr))
            .header("Origin", "http://localhost")
            .header("Access-Control-Request-Method", "GET")
            .send()
            .await
            .expect("Failed to send request");

        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("http://localhost")
        );

        let _ = shutdown_tx.send(());
    }
}
