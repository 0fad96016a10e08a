//! Integration tests for the replay stage
//!
//! These tests record blobs into temporary directories and replay them
//! end-to-end through real backends, routers and sinks.

use scraper::Selector;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use twostage::config::load_config_with_hash;
use twostage::output::{open_sinks, OutputSink, RunStatus, SqliteSink};
use twostage::router::HandlerError;
use twostage::{
    Compression, DirectoryBackend, HandlerOutput, HandlerResult, Record, RecordWriter, ReplayDriver,
    ReplayError, ReplayOptions, Response, Router, Rule, Shutdown, StorageLocation,
};

const QUOTES_PAGE_1: &str = r#"<html><head><title>Quotes to Scrape</title></head><body>
<div class="quote"><span class="text">“The world as we have created it is a process of our thinking.”</span>
<small class="author">Albert Einstein</small></div>
<div class="quote"><span class="text">“It is our choices that show what we truly are.”</span>
<small class="author">J.K. Rowling</small></div>
<li class="next"><a href="/page/2/">Next</a></li>
</body></html>"#;

const QUOTES_PAGE_2: &str = r#"<html><head><title>Quotes to Scrape</title></head><body>
<div class="quote"><span class="text">“Try not to become a man of success.”</span>
<small class="author">Albert Einstein</small></div>
</body></html>"#;

/// Writes `records` into a blob whose name selects its compression
fn write_blob(path: &Path, records: &[Record]) {
    let mut writer = RecordWriter::create(path).unwrap();
    for record in records {
        writer.write(record).unwrap();
    }
    writer.finish().unwrap();
}

fn page(url: &str, body: &str) -> Record {
    Record::new(url, body)
        .with_status(200)
        .with_header("Content-Type", "text/html; charset=utf-8")
}

/// Writes a config file replaying `root` into a database under `dir`
fn write_config(dir: &Path, root: &Path, extra: &str) -> PathBuf {
    let config_path = dir.join("twostage.toml");
    let content = format!(
        r#"
[source]
root = "{root}"

[replay]
concurrency = 2
{extra}

[output]
database-path = "{db}"
jsonl-path = "{jsonl}"

[[rule]]
pattern = '\.(css|js|png)$'
action = "drop"

[[rule]]
pattern = "/author/"
action = "summary"

[[rule]]
pattern = ".*"
action = "links"
"#,
        root = root.display(),
        extra = extra,
        db = dir.join("items.db").display(),
        jsonl = dir.join("items.jsonl").display(),
    );
    fs::write(&config_path, content).unwrap();
    config_path
}

fn selector(css: &str) -> Result<Selector, HandlerError> {
    Selector::parse(css).map_err(|e| HandlerError::from(format!("bad selector {}: {:?}", css, e)))
}

fn quotes(response: &Response) -> HandlerResult {
    let quote = selector("div.quote")?;
    let text = selector("span.text")?;
    let author = selector("small.author")?;
    let next = selector("li.next a[href]")?;

    let document = response.html();
    let mut outputs = Vec::new();
    for element in document.select(&quote) {
        let text: String = element
            .select(&text)
            .next()
            .map(|e| e.text().collect())
            .unwrap_or_default();
        let author: String = element
            .select(&author)
            .next()
            .map(|e| e.text().collect())
            .unwrap_or_default();
        outputs.push(HandlerOutput::Item(json!({ "text": text, "author": author })));
    }

    if let Some(href) = document
        .select(&next)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| response.urljoin(href))
    {
        // The next page was recorded too; replay it in place
        outputs.push(HandlerOutput::Record(Record::new(href, QUOTES_PAGE_2).with_status(200)));
    }

    Ok(outputs)
}

#[tokio::test]
async fn test_full_replay_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(data.join("2024")).unwrap();

    write_blob(
        &data.join("2024/site.records.gz"),
        &[
            page(
                "http://quotes.toscrape.com/",
                r#"<a href="/author/Albert-Einstein">Einstein</a><a href="/tag/life/">life</a>"#,
            ),
            page("http://quotes.toscrape.com/static/main.css", "body {}"),
            page(
                "http://quotes.toscrape.com/author/Albert-Einstein",
                "<title>Albert Einstein</title>",
            ),
        ],
    );

    let config_path = write_config(dir.path(), &data, "");
    let (config, hash) = load_config_with_hash(&config_path).unwrap();

    let sink: Arc<dyn OutputSink> = Arc::new(open_sinks(&config.output).unwrap());
    sink.begin_run(&hash, &config.source.root).unwrap();

    let driver = ReplayDriver::new(
        config.backend().unwrap(),
        config.build_router().unwrap(),
        config.replay_options(),
    );
    let stats = driver.run(sink, &Shutdown::new()).await.unwrap();

    assert_eq!(stats.locations_listed, 1);
    assert_eq!(stats.records_decoded, 3);
    // two links from the index page plus the author summary
    assert_eq!(stats.items_emitted, 3);

    let db = SqliteSink::open(&dir.path().join("items.db")).unwrap();
    let summary = db.statistics().unwrap();
    assert_eq!(summary.status, RunStatus::Completed.to_db_string());
    assert_eq!(summary.config_hash, hash);
    assert_eq!(summary.total_items, 3);
    assert_eq!(summary.items_by_host, vec![("quotes.toscrape.com".to_string(), 3)]);

    let lines: Vec<Value> = fs::read_to_string(dir.path().join("items.jsonl"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["item"]["to"], "http://quotes.toscrape.com/author/Albert-Einstein");
    assert_eq!(lines[1]["item"]["to"], "http://quotes.toscrape.com/tag/life/");
    assert_eq!(lines[2]["item"]["title"], "Albert Einstein");
    assert_eq!(lines[2]["item"]["status"], 200);
}

#[tokio::test]
async fn test_corrupt_blob_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();

    write_blob(
        &data.join("good.records"),
        &[page("http://example.com/a", ""), page("http://example.com/b", "")],
    );

    let bad_path = data.join("bad.records");
    write_blob(
        &bad_path,
        &[page("http://example.com/x", ""), page("http://example.com/y", "")],
    );
    let mut bytes = fs::read(&bad_path).unwrap();
    bytes.truncate(bytes.len() - 5);
    fs::write(&bad_path, bytes).unwrap();

    let rules = vec![Rule::handle(".*", "echo", |response: &Response| -> HandlerResult {
        Ok(vec![HandlerOutput::Item(json!(response.url()))])
    })
    .unwrap()];
    let driver = ReplayDriver::new(
        Arc::new(DirectoryBackend::new(&data).unwrap()),
        Router::new(rules).unwrap(),
        ReplayOptions::default(),
    );

    let sink = Arc::new(SqliteSink::in_memory().unwrap());
    sink.begin_run("hash", "data").unwrap();
    let stats = driver.run(sink.clone(), &Shutdown::new()).await.unwrap();

    assert_eq!(stats.locations_replayed, 1);
    assert_eq!(stats.locations_skipped, 1);
    // the record before the damage still counts
    assert_eq!(stats.items_emitted, 3);

    let summary = sink.statistics().unwrap();
    assert_eq!(summary.skipped.len(), 1);
    assert!(summary.skipped[0].0.ends_with("bad.records"));
    assert!(summary.skipped[0].1.contains("record 1"));
}

#[tokio::test]
async fn test_corrupt_blob_is_fatal_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();

    let path = data.join("bad.records");
    write_blob(&path, &[page("http://example.com/x", "")]);
    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 1);
    fs::write(&path, bytes).unwrap();

    let config_path = write_config(dir.path(), &data, "fail-on-corrupt = true");
    let (config, hash) = load_config_with_hash(&config_path).unwrap();

    let sink = Arc::new(SqliteSink::open(&dir.path().join("items.db")).unwrap());
    sink.begin_run(&hash, &config.source.root).unwrap();
    let driver = ReplayDriver::new(
        config.backend().unwrap(),
        config.build_router().unwrap(),
        config.replay_options(),
    );

    let result = driver.run(sink.clone(), &Shutdown::new()).await;
    assert!(matches!(result, Err(ReplayError::CorruptStream(_))));
    assert_eq!(sink.statistics().unwrap().status, "failed");
}

#[tokio::test]
async fn test_quotes_extraction_with_inline_pages() {
    let dir = tempfile::tempdir().unwrap();
    write_blob(
        &dir.path().join("quotes.records"),
        &[page("http://quotes.toscrape.com/", QUOTES_PAGE_1)],
    );

    let driver = ReplayDriver::new(
        Arc::new(DirectoryBackend::new(dir.path()).unwrap()),
        Router::new(vec![Rule::handle("quotes\\.toscrape\\.com", "quotes", quotes).unwrap()]).unwrap(),
        ReplayOptions::default(),
    );

    let mut replay = driver.replay();
    let mut items = Vec::new();
    while let Some(result) = replay.next().await {
        let item = result.unwrap();
        if let HandlerOutput::Item(value) = item.output {
            items.push((item.url, value));
        }
    }

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].0, "http://quotes.toscrape.com/");
    assert_eq!(items[0].1["author"], "Albert Einstein");
    assert_eq!(items[1].1["author"], "J.K. Rowling");
    assert_eq!(items[2].0, "http://quotes.toscrape.com/page/2/");
    assert_eq!(items[2].1["text"], "“Try not to become a man of success.”");
    assert_eq!(replay.stats().records_decoded, 1);
}

#[tokio::test]
async fn test_follow_up_outside_root() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let archive = dir.path().join("archive");
    fs::create_dir_all(&data).unwrap();
    fs::create_dir_all(&archive).unwrap();

    write_blob(
        &data.join("index.records"),
        &[page("http://example.com/", ""), page("http://example.com/again", "")],
    );
    let archived = archive.join("older.records.gz");
    write_blob(&archived, &[page("http://example.com/2019", "")]);
    let archived = fs::canonicalize(&archived).unwrap();

    let target = StorageLocation::File(archived.clone());
    let rules = vec![
        Rule::handle("/2019$", "archived", |response: &Response| -> HandlerResult {
            Ok(vec![HandlerOutput::Item(json!({ "archived": response.url() }))])
        })
        .unwrap(),
        Rule::handle(".*", "index", move |_: &Response| -> HandlerResult {
            Ok(vec![HandlerOutput::FollowUp(target.clone())])
        })
        .unwrap(),
    ];
    let driver = ReplayDriver::new(
        Arc::new(DirectoryBackend::new(&data).unwrap()),
        Router::new(rules).unwrap(),
        ReplayOptions::default(),
    );

    let sink = Arc::new(SqliteSink::in_memory().unwrap());
    sink.begin_run("hash", "data").unwrap();
    let stats = driver.run(sink.clone(), &Shutdown::new()).await.unwrap();

    assert_eq!(stats.locations_listed, 1);
    assert_eq!(stats.follow_ups_queued, 1);
    assert_eq!(stats.locations_replayed, 2);
    assert_eq!(stats.items_emitted, 1);
    assert_eq!(sink.statistics().unwrap().follow_ups_queued, 1);
}

#[tokio::test]
async fn test_unrouted_url_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    write_blob(
        &dir.path().join("mixed.records"),
        &[page("http://example.com/keep", ""), page("http://other.org/", "")],
    );

    let driver = ReplayDriver::new(
        Arc::new(DirectoryBackend::new(dir.path()).unwrap()),
        Router::new(vec![Rule::handle("example\\.com", "keep", |_: &Response| -> HandlerResult {
            Ok(vec![HandlerOutput::Item(json!(1))])
        })
        .unwrap()])
        .unwrap(),
        ReplayOptions::default(),
    );

    let sink = Arc::new(SqliteSink::in_memory().unwrap());
    sink.begin_run("hash", "data").unwrap();
    let result = driver.run(sink.clone(), &Shutdown::new()).await;

    assert!(matches!(result, Err(ReplayError::UnroutedUrl { url }) if url == "http://other.org/"));
    let summary = sink.statistics().unwrap();
    assert_eq!(summary.status, "failed");
    assert_eq!(summary.total_items, 1);
}

#[tokio::test]
async fn test_handler_error_carries_rule_and_url() {
    let dir = tempfile::tempdir().unwrap();
    write_blob(
        &dir.path().join("one.records"),
        &[page("http://example.com/broken", "")],
    );

    let driver = ReplayDriver::new(
        Arc::new(DirectoryBackend::new(dir.path()).unwrap()),
        Router::new(vec![Rule::handle(".*", "strict", |_: &Response| -> HandlerResult {
            Err(anyhow::anyhow!("missing price").into())
        })
        .unwrap()])
        .unwrap(),
        ReplayOptions::default(),
    );

    let mut replay = driver.replay();
    match replay.next().await {
        Some(Err(ReplayError::Handler { rule, url, source })) => {
            assert_eq!(rule, "strict");
            assert_eq!(url, "http://example.com/broken");
            assert_eq!(source.to_string(), "missing price");
        }
        other => panic!("expected handler error, got {:?}", other.map(|r| r.is_ok())),
    }
    assert!(replay.next().await.is_none());
}

#[test]
fn test_blob_extension_selects_compression() {
    assert_eq!(Compression::from_name("a/b.records").unwrap(), Compression::None);
    assert_eq!(Compression::from_name("a/b.records.gz").unwrap(), Compression::Gzip);
    assert!(Compression::from_name("a/b.json").is_err());
}
