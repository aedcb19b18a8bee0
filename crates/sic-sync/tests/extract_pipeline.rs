use std::path::Path;
use std::time::Duration;

use sic_adapters::ExtractError;
use sic_storage::RecordFile;
use sic_sync::{run_extract_once, ExtractConfig};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn serve_once(status_line: &'static str, body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 8192];
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("\r\n\r\n") {
            let n = socket.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "{status_line}\r\ncontent-type: text/html; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.expect("write");
        socket.shutdown().await.ok();
    });
    format!("http://{addr}/sic/")
}

fn fixture_html() -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/companies-house/sic.html");
    std::fs::read_to_string(path).expect("fixture html")
}

fn config(source_url: String, csv_path: &Path) -> ExtractConfig {
    ExtractConfig {
        source_url,
        csv_path: csv_path.to_path_buf(),
        user_agent: "sic-sync-test".to_string(),
        http_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn extract_writes_classified_csv() {
    let dir = tempdir().expect("tempdir");
    let csv_path = dir.path().join("sic_codes.csv");
    let url = serve_once("HTTP/1.1 200 OK", fixture_html()).await;

    let summary = run_extract_once(&config(url, &csv_path)).await.expect("extract");
    assert_eq!(summary.records, 11);
    assert_eq!(summary.tally.count("Section A"), 3);
    assert_eq!(summary.tally.count("Unclassified"), 1);

    let records = RecordFile::new(&csv_path).read_all().await.expect("read back");
    assert_eq!(records.len(), 11);
    assert_eq!(records[0].code, "01110");
    assert_eq!(records[0].section, "Section A");
    assert_eq!(records[0].section_title, "Agriculture, Forestry and Fishing");
    assert_eq!(records[10].code, "ABC");
    assert_eq!(records[10].section, "Unclassified");
}

#[tokio::test]
async fn unreachable_page_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let csv_path = dir.path().join("sic_codes.csv");
    let url = serve_once("HTTP/1.1 502 Bad Gateway", String::new()).await;

    let err = run_extract_once(&config(url, &csv_path)).await.expect_err("fetch failure");
    let extract_err = err.downcast_ref::<ExtractError>().expect("typed extract error");
    assert!(matches!(extract_err, ExtractError::Fetch(_)));
    assert!(!csv_path.exists());
}

#[tokio::test]
async fn page_without_table_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let csv_path = dir.path().join("sic_codes.csv");
    let url = serve_once(
        "HTTP/1.1 200 OK",
        "<html><body><p>We are updating this page.</p></body></html>".to_string(),
    )
    .await;

    let err = run_extract_once(&config(url, &csv_path)).await.expect_err("structural failure");
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::TableNotFound)
    ));
    assert!(!csv_path.exists());
}

#[tokio::test]
async fn table_of_non_data_rows_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let csv_path = dir.path().join("sic_codes.csv");
    let url = serve_once(
        "HTTP/1.1 200 OK",
        "<table><tr><td>Section A</td><td>Agriculture</td></tr><tr><td>only one cell</td></tr></table>"
            .to_string(),
    )
    .await;

    let err = run_extract_once(&config(url, &csv_path)).await.expect_err("no records");
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::NoRecords)
    ));
    assert!(!csv_path.exists());
}
