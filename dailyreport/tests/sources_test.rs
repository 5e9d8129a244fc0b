use std::time::Duration;

use common::{SourceConfig, SourceKind};
use dailyreport::article::{ArticleRef, ExtractionStatus};
use dailyreport::scraping::{ArticleExtractor, ExtractionError, ReadabilityExtractor};
use dailyreport::sources::json_api::JsonApiSource;
use dailyreport::sources::rss::RssSource;
use dailyreport::sources::html::HtmlListingSource;
use dailyreport::sources::{FetchError, SourceAdapter, SourceHttp};

const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>QbitAI</title>
    <link>https://www.qbitai.com</link>
    <description>AI news</description>
    <item>
      <title>Older story</title>
      <link>https://www.qbitai.com/2026/10/100.html?utm_source=rss</link>
      <pubDate>Thu, 15 Oct 2026 08:00:00 +0000</pubDate>
      <description>Short teaser</description>
    </item>
    <item>
      <title>Newer story</title>
      <link>https://www.qbitai.com/2026/10/101.html</link>
      <pubDate>Fri, 16 Oct 2026 08:00:00 +0000</pubDate>
      <description>Another teaser</description>
    </item>
  </channel>
</rss>"#;

fn http() -> SourceHttp {
    SourceHttp::new(Duration::from_secs(5))
        .expect("client")
        .with_retries(3, Duration::from_millis(10))
}

#[tokio::test]
async fn rss_source_returns_newest_first() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/feed")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(FEED)
        .create_async()
        .await;

    let source = RssSource::new("qbitai", format!("{}/feed", server.url()), http());
    let articles = source.fetch_recent(10, None).await.expect("fetch");

    assert_eq!(articles.len(), 2);
    assert_eq!(articles[0].title, "Newer story");
    assert_eq!(articles[1].url, "https://www.qbitai.com/2026/10/100.html");
    assert_eq!(articles[1].excerpt.as_deref(), Some("Short teaser"));
    assert!(articles.iter().all(|a| a.origin == "qbitai"));

    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_are_retried() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("GET", "/feed")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let source = RssSource::new("qbitai", format!("{}/feed", server.url()), http());
    let err = source.fetch_recent(10, None).await.unwrap_err();
    assert!(matches!(err, FetchError::Status(503)));

    failing.assert_async().await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let missing = server
        .mock("GET", "/feed")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let source = RssSource::new("qbitai", format!("{}/feed", server.url()), http());
    let err = source.fetch_recent(10, None).await.unwrap_err();
    assert!(matches!(err, FetchError::Status(404)));

    missing.assert_async().await;
}

#[tokio::test]
async fn malformed_feed_is_a_parse_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/feed")
        .with_status(200)
        .with_body("definitely not a feed")
        .create_async()
        .await;

    let source = RssSource::new("qbitai", format!("{}/feed", server.url()), http());
    assert!(matches!(source.fetch_recent(10, None).await, Err(FetchError::Parse(_))));
}

#[tokio::test]
async fn html_listing_resolves_relative_links() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html; charset=utf-8")
        .with_body(r#"<html><body><h2><a href="/posts/1">First</a></h2><h2><a href="/posts/2">Second</a></h2></body></html>"#)
        .create_async()
        .await;

    let base = format!("{}/", server.url());
    let source = HtmlListingSource::new("aiera", &base, &["h2 a".to_string()], http()).expect("source");
    let articles = source.fetch_recent(10, None).await.expect("fetch");

    let urls: Vec<_> = articles.iter().map(|a| a.url.clone()).collect();
    assert_eq!(urls, vec![format!("{}/posts/1", server.url()), format!("{}/posts/2", server.url())]);
}

#[tokio::test]
async fn json_api_source_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/v4/articles.json")
        .match_query(mockito::Matcher::UrlEncoded("sort".into(), "time".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"articles": [
            {"title": "Earlier", "slug": "a", "published_at": "2026-10-15 09:00:00"},
            {"title": "Later", "slug": "b", "published_at": "2026-10-16 09:00:00"}
        ]}"#)
        .create_async()
        .await;

    let cfg = SourceConfig {
        id: "jiqizhixin".into(),
        name: None,
        kind: SourceKind::Json,
        url: format!("{}/api/v4/articles.json?sort=time", server.url()),
        selectors: vec![],
        items_field: None,
        title_field: None,
        url_field: None,
        slug_field: None,
        url_template: Some("https://www.jiqizhixin.com/articles/{slug}".into()),
        published_field: Some("published_at".into()),
    };
    let source = JsonApiSource::from_config(&cfg, http()).expect("source");
    let articles = source.fetch_recent(10, None).await.expect("fetch");

    assert_eq!(articles[0].title, "Later");
    assert_eq!(articles[0].url, "https://www.jiqizhixin.com/articles/b");
}

const ARTICLE_PAGE: &str = r#"<html><head><title>Big model news</title></head><body>
<nav><a href="/">Home</a> <a href="/about">About</a></nav>
<article>
  <h1>Big model news</h1>
  <p>The lab released a new open model today, trained on a large multilingual corpus and tuned for reasoning tasks across many domains.</p>
  <p>Benchmarks published alongside the weights show strong results on math and coding, while the authors caution that evaluation is still ongoing.</p>
  <p>The release includes a permissive license, inference code and a technical report describing the data pipeline and the training recipe in detail.</p>
</article>
<footer>Copyright 2026</footer>
</body></html>"#;

#[tokio::test]
async fn readability_extracts_article_body() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/2026/10/16/model")
        .with_status(200)
        .with_header("content-type", "text/html; charset=utf-8")
        .with_body(ARTICLE_PAGE)
        .create_async()
        .await;

    let extractor = ReadabilityExtractor::new(Duration::from_secs(5), 100).expect("extractor");
    let article = ArticleRef::new("aiera", &format!("{}/2026/10/16/model", server.url()), "Big model news", None)
        .expect("article");

    let content = extractor.extract(&article).await.expect("extract");
    assert_eq!(content.status, ExtractionStatus::Extracted);
    assert!(content.body.contains("new open model"));
    assert!(!content.body.contains("<p>"));
}

#[tokio::test]
async fn near_empty_page_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/empty")
        .with_status(200)
        .with_body("<html><body><p>Subscribe!</p></body></html>")
        .create_async()
        .await;

    let extractor = ReadabilityExtractor::new(Duration::from_secs(5), 100).expect("extractor");
    let article = ArticleRef::new("aiera", &format!("{}/empty", server.url()), "Empty", None).expect("article");

    let err = extractor.extract(&article).await.unwrap_err();
    assert!(matches!(err, ExtractionError::TooShort { .. } | ExtractionError::Readability(_)));
}

#[tokio::test]
async fn missing_page_is_an_extraction_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server.mock("GET", "/gone").with_status(404).create_async().await;

    let extractor = ReadabilityExtractor::new(Duration::from_secs(5), 100).expect("extractor");
    let article = ArticleRef::new("aiera", &format!("{}/gone", server.url()), "Gone", None).expect("article");

    assert!(matches!(extractor.extract(&article).await, Err(ExtractionError::Status(404))));
}
