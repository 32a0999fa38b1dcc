//! End-to-end harvest tests against a mocked OpenAlex API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use openalex_harvest::config::{SamplePercent, SearchConfig};
use openalex_harvest::openalex::{ClientConfig, OpenAlexClient, RandomSampler, SEED_SPACE};
use openalex_harvest::pipeline::{self, FetchMode, RunOptions};
use openalex_harvest::HarvestError;

fn search_config(percent: f64) -> SearchConfig {
    SearchConfig::parse(
        "start_year,2020\nend_year,2020\nsearch_terms,\"x\"\n",
        SamplePercent::new(percent).unwrap(),
    )
    .unwrap()
}

fn client(server: &MockServer) -> OpenAlexClient {
    OpenAlexClient::new(ClientConfig::for_testing(&server.uri())).unwrap()
}

fn options(dir: &Path, batch_size: usize) -> RunOptions {
    RunOptions {
        output_dir: dir.to_path_buf(),
        batch_size,
        mode: FetchMode::All,
    }
}

fn work(n: usize) -> Value {
    json!({
        "id": format!("https://openalex.org/W{}", n),
        "title": format!("Paper {}", n),
        "publication_year": 2020,
        "cited_by_count": n,
        "authorships": [{"author": {"display_name": "A. Author"}, "institutions": []}]
    })
}

fn page(count: u64, works: Vec<Value>, next_cursor: Option<&str>) -> Value {
    json!({
        "meta": {"count": count, "per_page": 200, "next_cursor": next_cursor},
        "results": works
    })
}

async fn mount_page(server: &MockServer, cursor: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path("/works"))
        .and(query_param("cursor", cursor))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Read one request head off the socket.
async fn read_request(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        head.extend_from_slice(&buf[..n]);
    }
}

/// Server whose first response promises more body than it sends, then serves `body`.
async fn truncated_then_ok(body: Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = body.to_string();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 4096\r\n\r\n{\"meta\"")
            .await
            .unwrap();
        drop(socket);

        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    });

    format!("http://{}", addr)
}

fn row_counts(files: &[PathBuf]) -> Vec<usize> {
    files
        .iter()
        .map(|p| {
            let mut rdr = csv::Reader::from_path(p).unwrap();
            rdr.records().map(|r| r.unwrap()).count()
        })
        .collect()
}

#[tokio::test]
async fn test_three_records_over_two_pages_make_one_file() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .and(query_param("cursor", "*"))
        .and(query_param(
            "filter",
            "title_and_abstract.search:x,publication_year:2020-2020",
        ))
        .and(query_param("per-page", "200"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(page(3, vec![work(1), work(2)], Some("page2"))),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_page(&server, "page2", page(3, vec![work(3)], None)).await;

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.total_count, Some(3));
    assert_eq!(summary.written, 3);
    assert_eq!(summary.files.len(), 1);
    assert_eq!(row_counts(&summary.files), vec![3]);
    assert!(summary.files[0].ends_with("papers_batch_1.csv"));
}

#[tokio::test]
async fn test_full_percent_writes_total_in_bounded_batches() {
    let server = MockServer::start().await;
    mount_page(&server, "*", page(5, vec![work(1), work(2)], Some("c2"))).await;
    mount_page(&server, "c2", page(5, vec![work(3), work(4)], Some("c3"))).await;
    mount_page(&server, "c3", page(5, vec![work(5)], Some("c4"))).await;
    mount_page(&server, "c4", page(5, vec![], None)).await;

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 2), &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.written, 5);
    assert_eq!(row_counts(&summary.files), vec![2, 2, 1]);
}

#[tokio::test]
async fn test_partial_percent_stops_at_rounded_up_target() {
    let server = MockServer::start().await;
    mount_page(&server, "*", page(5, vec![work(1), work(2)], Some("c2"))).await;
    mount_page(&server, "c2", page(5, vec![work(3), work(4)], Some("c3"))).await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .and(query_param("cursor", "c3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(5, vec![work(5)], None)))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(50.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap();

    // ceil(0.5 * 5) = 3
    assert_eq!(summary.target, Some(3));
    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.written, 3);
    assert_eq!(row_counts(&summary.files), vec![3]);
}

#[tokio::test]
async fn test_records_missing_required_fields_are_skipped() {
    let server = MockServer::start().await;
    let untitled = json!({"id": "https://openalex.org/W99", "title": null});
    mount_page(&server, "*", page(3, vec![work(1), untitled, work(2)], None)).await;

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.written, 2);
}

#[tokio::test]
async fn test_institutionless_work_has_empty_institution_column() {
    let server = MockServer::start().await;
    mount_page(&server, "*", page(1, vec![work(1)], None)).await;

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap();

    let mut rdr = csv::Reader::from_path(&summary.files[0]).unwrap();
    let headers = rdr.headers().unwrap().clone();
    let column = headers.iter().position(|h| h == "institution_names").unwrap();
    let record = rdr.records().next().unwrap().unwrap();
    assert_eq!(record.get(column), Some(""));
}

#[tokio::test]
async fn test_api_error_aborts_and_keeps_flushed_batches() {
    let server = MockServer::start().await;
    mount_page(&server, "*", page(4, vec![work(1), work(2)], Some("broken"))).await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .and(query_param("cursor", "broken"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad cursor"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = pipeline::run(&search_config(100.0), &options(dir.path(), 2), &client(&server))
        .await
        .unwrap_err();

    match err {
        HarvestError::Api { code, cursor, .. } => {
            assert_eq!(code, 400);
            assert_eq!(cursor, "broken");
        }
        other => panic!("unexpected error: {other}"),
    }

    let first = dir.path().join("papers_batch_1.csv");
    assert!(first.exists());
    assert_eq!(row_counts(&[first]), vec![2]);
}

#[tokio::test]
async fn test_transient_server_error_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_page(&server, "*", page(1, vec![work(1)], None)).await;

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.written, 1);
}

#[tokio::test]
async fn test_rate_limit_exhausts_retries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::RateLimited { attempts: 4, .. }));
}

#[tokio::test]
async fn test_malformed_json_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"meta\": "))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::Parse(_)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_no_matches_writes_no_files() {
    let server = MockServer::start().await;
    mount_page(&server, "*", page(0, vec![], None)).await;

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.total_count, Some(0));
    assert!(summary.files.is_empty());
}

#[tokio::test]
async fn test_invalid_date_range_fails_before_any_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(1, vec![work(1)], None)))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("search.txt");
    std::fs::write(&file, "start_year,2022\nend_year,2020\nsearch_terms,x\n").unwrap();
    let out = dir.path().join("out");

    let err = pipeline::run_from_file(
        &file,
        SamplePercent::ALL,
        &RunOptions::new(&out),
        ClientConfig::for_testing(&server.uri()),
    )
    .await
    .unwrap_err();

    assert!(err.is_config());
    assert!(!out.exists());
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_run_from_file_harvests_valid_search() {
    let server = MockServer::start().await;
    mount_page(&server, "*", page(2, vec![work(1), work(2)], None)).await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("search.txt");
    std::fs::write(&file, "start_year,2020\nend_year,2020\nsearch_terms,x\n").unwrap();
    let out = dir.path().join("out");

    let summary = pipeline::run_from_file(
        &file,
        SamplePercent::ALL,
        &RunOptions::new(&out),
        ClientConfig::for_testing(&server.uri()),
    )
    .await
    .unwrap();

    assert_eq!(summary.written, 2);
    assert_eq!(summary.files, vec![out.join("papers_batch_1.csv")]);
}

#[tokio::test]
async fn test_rerun_replaces_previous_batches() {
    let server = MockServer::start().await;
    mount_page(&server, "*", page(1, vec![work(1)], None)).await;

    let dir = tempfile::tempdir().unwrap();
    for k in 1..=3 {
        std::fs::write(dir.path().join(format!("papers_batch_{}.csv", k)), "id\nold\n").unwrap();
    }

    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.files.len(), 1);
    let mut on_disk: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    on_disk.sort();
    assert_eq!(on_disk, vec!["papers_batch_1.csv"]);
    assert_eq!(row_counts(&summary.files), vec![1]);
}

#[tokio::test]
async fn test_timed_out_request_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page(1, vec![work(1)], None))
                .set_delay(Duration::from_secs(2)),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_page(&server, "*", page(1, vec![work(1)], None)).await;

    let client = OpenAlexClient::new(ClientConfig {
        timeout: Duration::from_millis(300),
        ..ClientConfig::for_testing(&server.uri())
    })
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client)
        .await
        .unwrap();

    assert_eq!(summary.written, 1);
}

#[tokio::test]
async fn test_truncated_body_is_retried() {
    let base_url = truncated_then_ok(page(1, vec![work(1)], None)).await;
    let client = OpenAlexClient::new(ClientConfig::for_testing(&base_url)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let summary = pipeline::run(&search_config(100.0), &options(dir.path(), 1000), &client)
        .await
        .unwrap();

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.written, 1);
}

#[tokio::test]
async fn test_random_mode_collects_distinct_works() {
    let server = MockServer::start().await;

    // Every seed returns the same two works
    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(2, vec![work(1), work(2)], None)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let run_options = RunOptions {
        mode: FetchMode::Random { max_papers: 3 },
        ..options(dir.path(), 1000)
    };
    let summary = pipeline::run(&search_config(100.0), &run_options, &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.written, 2);
    assert_eq!(row_counts(&summary.files), vec![2]);
}

#[tokio::test]
async fn test_random_mode_stops_at_max_papers() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .and(query_param("sample", "2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(page(10, vec![work(1), work(2), work(3)], None)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let run_options = RunOptions {
        mode: FetchMode::Random { max_papers: 2 },
        ..options(dir.path(), 1000)
    };
    let summary = pipeline::run(&search_config(100.0), &run_options, &client(&server))
        .await
        .unwrap();

    assert_eq!(summary.written, 2);
}

#[tokio::test]
async fn test_seeded_sampler_requests_reproducible_seeds() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(1, vec![work(1)], None)))
        .mount(&server)
        .await;

    let config = search_config(100.0);
    let client = client(&server);
    for _ in 0..2 {
        let mut sampler = RandomSampler::with_rng(&client, &config, 1, StdRng::seed_from_u64(7));
        let records = sampler.next_page().await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert!(sampler.next_page().await.unwrap().is_none());
    }

    let expected = StdRng::seed_from_u64(7).gen_range(0..SEED_SPACE).to_string();
    let seeds: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "seed")
                .map(|(_, v)| v.into_owned())
                .unwrap()
        })
        .collect();
    assert_eq!(seeds, vec![expected.clone(), expected]);
}
