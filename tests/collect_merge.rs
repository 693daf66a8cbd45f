// tests/collect_merge.rs
// Collection merge semantics across repeated runs, through the public
// loader/collect surface with in-process loaders.

use anyhow::Result;
use async_trait::async_trait;

use digest::collect::{collect_all, Loader, RawItem};
use digest::store::{dedup_key, Store};

/// In-process loader standing in for an external executable.
struct FakeLoader {
    name: String,
    items: Vec<RawItem>,
    fail: bool,
}

impl FakeLoader {
    fn new(name: &str, items: Vec<RawItem>) -> Self {
        Self {
            name: name.to_string(),
            items,
            fail: false,
        }
    }

    fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl Loader for FakeLoader {
    async fn fetch(&self) -> Result<Vec<RawItem>> {
        if self.fail {
            anyhow::bail!("loader exploded");
        }
        Ok(self.items.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn raw(source: &str, link: &str) -> RawItem {
    RawItem {
        source: source.to_string(),
        title: format!("Title {link}"),
        link: link.to_string(),
        creation_date: None,
        input: serde_json::json!({"body": link}),
    }
}

#[tokio::test]
async fn re_collection_of_identical_fetch_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    let loaders: Vec<Box<dyn Loader>> = vec![Box::new(FakeLoader::new(
        "arxiv",
        vec![raw("arxiv", "a"), raw("arxiv", "b")],
    ))];

    let mut store = Store::open(&path).unwrap();
    collect_all(&mut store, &loaders).await.unwrap();
    let keys_before: Vec<String> = store.iter().map(|i| i.dedup_key.clone()).collect();
    let evals_before: Vec<usize> = store.iter().map(|i| i.evals.len()).collect();

    collect_all(&mut store, &loaders).await.unwrap();
    let keys_after: Vec<String> = store.iter().map(|i| i.dedup_key.clone()).collect();
    let evals_after: Vec<usize> = store.iter().map(|i| i.evals.len()).collect();

    assert_eq!(keys_before, keys_after);
    assert_eq!(evals_before, evals_after);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn one_failing_loader_does_not_abort_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let loaders: Vec<Box<dyn Loader>> = vec![
        Box::new(FakeLoader::failing("producthunt")),
        Box::new(FakeLoader::new("arxiv", vec![raw("arxiv", "a")])),
    ];

    let mut store = Store::open(dir.path().join("data.json")).unwrap();
    let stats = collect_all(&mut store, &loaders).await.unwrap();

    assert_eq!(stats.failed_sources, 1);
    assert_eq!(stats.new_items, 1);
    assert!(store.get(&dedup_key("arxiv", "a")).is_some());
}

#[tokio::test]
async fn same_link_from_different_sources_stays_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let loaders: Vec<Box<dyn Loader>> = vec![
        Box::new(FakeLoader::new("arxiv", vec![raw("arxiv", "x")])),
        Box::new(FakeLoader::new("freshrss", vec![raw("freshrss", "x")])),
    ];

    let mut store = Store::open(dir.path().join("data.json")).unwrap();
    collect_all(&mut store, &loaders).await.unwrap();
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn collection_is_persisted_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    let loaders: Vec<Box<dyn Loader>> =
        vec![Box::new(FakeLoader::new("arxiv", vec![raw("arxiv", "a")]))];

    let mut store = Store::open(&path).unwrap();
    collect_all(&mut store, &loaders).await.unwrap();

    let reloaded = Store::open(&path).unwrap();
    assert_eq!(reloaded.len(), 1);
}
