//! ClickHouse destination over the HTTP interface.

use super::{AnalyticsDestination, DestinationError, EncodedBatch};
use anyhow::Result;
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::debug;

/// Expected layout of the destination table. Duplicated deliveries collapse
/// on merge, keeping the row with the highest `version`.
pub const CLICKHOUSE_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS ci_finished_builds
(
    id Int64,
    project_id Int64,
    pipeline_id Int64,
    name String,
    stage Nullable(String),
    status LowCardinality(String),
    ref_name Nullable(String),
    created_at DateTime64(6, 'UTC'),
    queued_at Nullable(DateTime64(6, 'UTC')),
    started_at Nullable(DateTime64(6, 'UTC')),
    finished_at Nullable(DateTime64(6, 'UTC')),
    duration_ms Nullable(Int64),
    queueing_duration_ms Nullable(Int64),
    root_namespace_id Nullable(Int64),
    namespace_path String,
    runner_id Nullable(Int64),
    runner_type Nullable(String),
    runner_description Nullable(String),
    runner_tags Array(String),
    runner_manager_system_xid Nullable(String),
    runner_manager_version Nullable(String),
    runner_manager_platform Nullable(String),
    runner_manager_architecture Nullable(String),
    retries_count UInt32,
    artifacts_count UInt32,
    artifacts_size_bytes Int64,
    artifact_file_types Array(String),
    version Int64
)
ENGINE = ReplacingMergeTree(version)
ORDER BY id
"#;

pub struct ClickHouseDestination {
    client: Client,
    base_url: String,
    table: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseDestination {
    pub fn new(
        base_url: &str,
        table: &str,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            user,
            password,
        })
    }

    fn insert_url(&self) -> String {
        let query = format!("INSERT INTO {} FORMAT JSONEachRow", self.table);
        format!("{}/?query={}", self.base_url, urlencoding::encode(&query))
    }
}

impl AnalyticsDestination for ClickHouseDestination {
    fn write_batch(&self, batch: &EncodedBatch) -> Result<(), DestinationError> {
        let mut request = self
            .client
            .post(self.insert_url())
            .header("Content-Type", "application/x-ndjson")
            .body(batch.payload.clone());
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DestinationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            "Inserted {} rows into ClickHouse table {}",
            batch.row_count, self.table
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_url_encodes_query() {
        let destination = ClickHouseDestination::new(
            "http://localhost:8123/",
            "ci_finished_builds",
            None,
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(
            destination.insert_url(),
            "http://localhost:8123/?query=INSERT%20INTO%20ci_finished_builds%20FORMAT%20JSONEachRow"
        );
    }

    #[test]
    fn test_ddl_merges_on_version() {
        assert!(CLICKHOUSE_TABLE_DDL.contains("ReplacingMergeTree(version)"));
        assert!(CLICKHOUSE_TABLE_DDL.contains("ORDER BY id"));
    }

    #[test]
    fn test_unreachable_server_is_transport_error() {
        // Port 9 (discard) is closed on test machines
        let destination = ClickHouseDestination::new(
            "http://127.0.0.1:9",
            "t",
            None,
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        let batch = EncodedBatch {
            payload: "{}\n".to_string(),
            row_count: 1,
        };
        assert!(matches!(
            destination.write_batch(&batch),
            Err(DestinationError::Transport(_))
        ));
    }

    /// Serves a single request with `status_line` and `body`, returning the
    /// server address and the raw request it received.
    fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, std::thread::JoinHandle<String>) {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                head.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut request_body = vec![0; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let mut stream = reader.into_inner();
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            head + &String::from_utf8_lossy(&request_body)
        });
        (addr, handle)
    }

    #[test]
    fn test_server_error_is_rejected_with_status_and_body() {
        let (addr, server) = serve_once(
            "500 Internal Server Error",
            "Code: 60. DB::Exception: Table default.t does not exist",
        );
        let destination = ClickHouseDestination::new(
            &addr,
            "t",
            Some("sync".to_string()),
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let batch = EncodedBatch {
            payload: "{\"id\":1}\n".to_string(),
            row_count: 1,
        };

        let result = destination.write_batch(&batch);
        let request = server.join().unwrap();

        match result {
            Err(DestinationError::Rejected { status, body }) => {
                assert_eq!(status, 500);
                assert!(body.contains("Table default.t does not exist"));
            }
            other => panic!("expected a rejected batch, got {:?}", other),
        }
        assert!(request.starts_with("POST /?query=INSERT%20INTO%20t%20FORMAT%20JSONEachRow"));
        let lowered = request.to_ascii_lowercase();
        assert!(lowered.contains("x-clickhouse-user: sync"));
        assert!(lowered.contains("x-clickhouse-key: secret"));
        assert!(request.ends_with("{\"id\":1}\n"));
    }

    #[test]
    fn test_success_status_accepts_batch() {
        let (addr, server) = serve_once("200 OK", "");
        let destination =
            ClickHouseDestination::new(&addr, "t", None, None, Duration::from_secs(5)).unwrap();
        let batch = EncodedBatch {
            payload: "{\"id\":1}\n".to_string(),
            row_count: 1,
        };

        destination.write_batch(&batch).unwrap();
        server.join().unwrap();
    }
}
