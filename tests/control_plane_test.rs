//! HTTP Control Plane Integration Tests

#[cfg(test)]
mod tests {
    use presign_uploadr::config::ControlPlaneConfig;
    use presign_uploadr::control_plane::{
        ControlPlane, ControlPlaneError, FinishUpload, HttpControlPlane,
    };
    use presign_uploadr::upload::PartResult;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn control_plane(server: &MockServer) -> HttpControlPlane {
        HttpControlPlane::builder()
            .endpoint(&server.uri())
            .token("test-token")
            .workspace_id("ws-1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_finish_sends_tags_to_root_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads/up-1/finish"))
            .and(query_param("workspaceId", "ws-1"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_json(json!({
                "uploadId": "up-1",
                "fileName": "reads.bin",
                "withError": false,
                "tags": [
                    {"partNumber": 1, "eTag": "\"a\""},
                    {"partNumber": 2, "eTag": "\"b\""}
                ]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let request = FinishUpload::completed(
            "up-1",
            "reads.bin",
            vec![PartResult::new(1, "\"a\""), PartResult::new(2, "\"b\"")],
        );
        control_plane(&server).finish(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_nested_directory() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads/up-2/finish/results/run1"))
            .and(body_json(json!({
                "uploadId": "up-2",
                "fileName": "reads.bin",
                "withError": true,
                "tags": []
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let request =
            FinishUpload::failed("up-2", "reads.bin").with_output_dir(Some("results/run1".into()));
        control_plane(&server).finish(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("already finished"))
            .expect(1)
            .mount(&server)
            .await;

        let err = control_plane(&server)
            .finish(&FinishUpload::failed("up-3", "reads.bin"))
            .await
            .unwrap_err();

        match err {
            ControlPlaneError::Status { status, body } => {
                assert_eq!(status, 409);
                assert_eq!(body, "already finished");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_from_config_without_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads/up-4/finish"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = ControlPlaneConfig {
            endpoint: format!("{}/", server.uri()),
            token: None,
            workspace_id: None,
        };
        HttpControlPlane::from_config(&config)
            .unwrap()
            .finish(&FinishUpload::completed("up-4", "f", vec![]))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
        assert!(requests[0].url.query().is_none());
    }
}
