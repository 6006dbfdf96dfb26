//! Paginated feed example demonstrating infinite queries and observers.
//!
//! This example shows:
//! - An infinite query loading pages on demand
//! - `select` reshaping pages while keeping their params
//! - A plain query shared by two observers, fetched once
//! - Invalidation refetching the queries that are still observed
//!
//! The "server" is an in-memory feed with simulated latency.
//!
//! Run with: `cargo run --example paginated_feed`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use color_eyre::eyre::Result;
use futures::FutureExt;
use querykit::prelude::*;
use tokio::time::{Duration, sleep};

const PAGE_SIZE: u32 = 3;
const TOTAL_POSTS: u32 = 8;

/// A page of posts, as returned by the feed endpoint
#[derive(Debug, Clone)]
struct FeedPage {
    posts: Vec<String>,
    next_cursor: Option<u32>,
}

/// Simulates `GET /feed?cursor=<cursor>`
async fn fetch_feed(cursor: u32, requests: Arc<AtomicUsize>) -> Result<FeedPage, QueryError> {
    requests.fetch_add(1, Ordering::SeqCst);
    sleep(Duration::from_millis(50)).await;
    let end = (cursor + PAGE_SIZE).min(TOTAL_POSTS);
    Ok(FeedPage {
        posts: (cursor..end).map(|id| format!("post #{id}")).collect(),
        next_cursor: (end < TOTAL_POSTS).then_some(end),
    })
}

fn feed_options(requests: Arc<AtomicUsize>) -> InfiniteQueryOptions<u32, FeedPage, usize> {
    InfiniteQueryOptions::new(
        "feed",
        0,
        move |ctx: PageFnContext<u32>| fetch_feed(ctx.page_param, requests.clone()).boxed(),
        |last: &FeedPage, _all: &[FeedPage]| last.next_cursor,
    )
    .stale_time(Duration::from_secs(30))
    .select(|data| data.map_pages(|page| page.posts.len()))
}

fn profile_options(requests: Arc<AtomicUsize>) -> QueryOptions<String> {
    QueryOptions::new("profile", move |_: QueryFnContext| {
        let requests = requests.clone();
        async move {
            requests.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            Ok::<_, QueryError>("alice".to_string())
        }
        .boxed()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let client = QueryClient::new();
    let requests = Arc::new(AtomicUsize::new(0));

    // Infinite feed: one observer, pages loaded on demand
    let feed = InfiniteQueryObserver::new(&client, feed_options(requests.clone()))?;
    let _feed_sub = feed.subscribe(|result| {
        if result.is_fetching_next_page {
            println!("loading more...");
        }
    });

    sleep(Duration::from_millis(100)).await;
    loop {
        let result = feed.get_current_result();
        println!(
            "{} pages, posts per page {:?}, cursors {:?}",
            result.pages().len(),
            result.pages(),
            result.page_params()
        );
        if !result.has_next_page {
            break;
        }
        feed.fetch_next_page(None).await;
    }

    // Two observers of one query share a single request
    let profile_requests = Arc::new(AtomicUsize::new(0));
    let header = QueryObserver::new(&client, profile_options(profile_requests.clone()))?;
    let sidebar = QueryObserver::new(&client, profile_options(profile_requests.clone()))?;
    let _header_sub = header.subscribe(|result| {
        if let Some(name) = &result.data {
            println!("header: signed in as {name}");
        }
    });
    let _sidebar_sub = sidebar.subscribe(|_| {});
    sleep(Duration::from_millis(50)).await;
    println!(
        "profile requests after two observers: {}",
        profile_requests.load(Ordering::SeqCst)
    );

    // Invalidation refetches every feed page in order
    client.invalidate_queries(&QueryFilters::key("feed")).await;
    println!(
        "feed requests after invalidation: {}",
        requests.load(Ordering::SeqCst)
    );

    client.clear();
    Ok(())
}
