// Integration tests for infinite queries

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use querykit::{
    InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions, PageFnContext, QueryClient,
    QueryError, QueryFilters, QueryKey,
};
use tokio::time::{Duration, sleep};

#[derive(Debug, Clone, PartialEq)]
struct Page {
    cursor: u32,
    items: Vec<String>,
}

/// A feed of `total` pages addressed by cursor.
fn feed(calls: Arc<AtomicUsize>, total: u32) -> InfiniteQueryOptions<u32, Page> {
    InfiniteQueryOptions::new(
        "feed",
        0,
        move |ctx: PageFnContext<u32>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                Ok::<_, QueryError>(Page {
                    cursor: ctx.page_param,
                    items: vec![format!("post {}", ctx.page_param)],
                })
            }
            .boxed()
        },
        move |last: &Page, _all: &[Page]| (last.cursor + 1 < total).then_some(last.cursor + 1),
    )
}

#[tokio::test(start_paused = true)]
async fn test_pages_and_params_stay_paired() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(calls.clone(), 4))?;
    let _sub = observer.subscribe(|result| {
        assert_eq!(result.pages().len(), result.page_params().len());
    });
    sleep(Duration::from_millis(10)).await;

    for _ in 0..5 {
        let result = observer.fetch_next_page(None).await;
        assert_eq!(result.pages().len(), result.page_params().len());
    }

    let result = observer.get_current_result();
    assert_eq!(result.page_params(), [0, 1, 2, 3]);
    assert!(!result.has_next_page);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refetch_first_page_only() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(calls.clone(), 10))?;
    let _sub = observer.subscribe(|_| {});
    sleep(Duration::from_millis(10)).await;
    observer.fetch_next_page(None).await;
    observer.fetch_next_page(None).await;

    let before = observer.get_current_result();
    let fetched = calls.load(Ordering::SeqCst);

    let after = observer.refetch_page(|_, index, _| index == 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), fetched + 1);
    assert_eq!(after.pages().len(), 3);
    assert_eq!(after.pages()[1..], before.pages()[1..]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_manual_writes_keep_parity() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let broken = InfiniteData::<u32, Page>::new(vec![], vec![1]);
    assert!(matches!(broken, Err(QueryError::PageMismatch { .. })));

    let seeded = InfiniteData::new(
        vec![Page {
            cursor: 7,
            items: vec!["cached".to_string()],
        }],
        vec![7],
    )?;
    client.set_query_data("feed", move |_: Option<&InfiniteData<u32, Page>>| seeded.clone())?;

    let calls = Arc::new(AtomicUsize::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(calls.clone(), 10).stale_time(Duration::from_secs(60)))?;
    let _sub = observer.subscribe(|_| {});

    let result = observer.get_current_result();
    assert_eq!(result.page_params(), [7]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let result = observer.fetch_next_page(None).await;
    assert_eq!(result.page_params(), [7, 8]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_removed_query_starts_over() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(calls.clone(), 10))?;
    let _sub = observer.subscribe(|_| {});
    sleep(Duration::from_millis(10)).await;
    observer.fetch_next_page(None).await;
    assert_eq!(observer.get_current_result().pages().len(), 2);

    client.remove_queries(&QueryFilters::exact("feed"));
    let reset = observer.get_current_result();
    assert!(reset.is_idle());
    assert!(reset.pages().is_empty());
    assert!(!reset.has_next_page);

    // the next action binds a fresh entry holding a single page
    let result = observer.refetch().await;
    assert_eq!(result.pages().len(), 1);
    assert!(client.get_query_data::<InfiniteData<u32, Page>>(&QueryKey::from("feed")).is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refetches_share_one_pass() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let a = InfiniteQueryObserver::new(&client, feed(calls.clone(), 10))?;
    let b = InfiniteQueryObserver::new(&client, feed(calls.clone(), 10))?;
    let _a = a.subscribe(|_| {});
    let _b = b.subscribe(|_| {});
    sleep(Duration::from_millis(10)).await;
    a.fetch_next_page(None).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let (ra, rb) = tokio::join!(a.refetch(), b.refetch());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(ra.page_params(), [0, 1]);
    assert_eq!(rb.page_params(), [0, 1]);

    let (na, nb) = tokio::join!(a.fetch_next_page(None), b.fetch_next_page(None));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(na.page_params(), [0, 1, 2]);
    assert_eq!(nb.page_params(), [0, 1, 2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_selected_pages_stay_paired() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = feed(calls, 3).select(|data| data.map_pages(|page| page.items.len()));
    let observer = InfiniteQueryObserver::new(&client, options)?;
    let _sub = observer.subscribe(|result| {
        assert_eq!(result.pages().len(), result.page_params().len());
    });
    sleep(Duration::from_millis(10)).await;

    observer.fetch_next_page(None).await;
    let result = observer.fetch_next_page(None).await;
    assert_eq!(result.pages(), [1, 1, 1]);
    assert_eq!(result.page_params(), [0, 1, 2]);
    assert!(!result.has_next_page);
    Ok(())
}
