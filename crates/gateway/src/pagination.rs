//! Multi-page read accumulation.
//!
//! Queries and scans return one page per backend call. [`accumulate`] drives
//! the page loop and folds every page into an [`Accumulated`] result:
//!
//! - items are appended, `count` and `scanned_count` are summed (they are
//!   page-local on the wire)
//! - consumed capacity is merged by addition, per-index breakdowns included
//! - the last non-empty cursor is cloned out of the page and retained
//!
//! The loop stops when the backend returns no cursor, when `max_pages` pages
//! have been read, or when the caller's context ends. Cancellation or the
//! caller's deadline keeps the pages read so far and records the reason in [`Accumulated::interrupted`].
//!
//! [`page_cursors`] walks the same loop without keeping items and returns the
//! start cursor of every page. Index 0 is always `None` (start of the read),
//! so the cursor for page `n` sits at index `n - 1`.

use std::future::Future;

use crate::{
    context::CallContext,
    error::{ClassifiedError, ErrorKind, GatewayResult},
    types::{ConsumedCapacity, Item, Key, Page},
};

/// Pages folded into one result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulated {
    /// Items of every page, in page order.
    pub items: Vec<Item>,
    /// Sum of the per-page counts.
    pub count: u64,
    /// Sum of the per-page scanned counts.
    pub scanned_count: u64,
    /// The last non-empty cursor returned by the backend.
    pub last_evaluated_key: Option<Key>,
    /// Merged capacity across pages, when the backend reported any.
    pub consumed_capacity: Option<ConsumedCapacity>,
    /// Pages read.
    pub pages: u32,
    /// Whether the backend signalled the last page.
    pub complete: bool,
    /// Set when the caller's context ended before the read finished.
    pub interrupted: Option<ClassifiedError>,
}

impl Accumulated {
    /// Folds one page in. Returns `true` when the backend has more pages.
    pub fn absorb(&mut self, page: Page) -> bool {
        self.pages += 1;
        self.count += page.count;
        self.scanned_count += page.scanned_count;
        self.items.extend(page.items);

        if let Some(capacity) = &page.consumed_capacity {
            self.consumed_capacity.get_or_insert_with(ConsumedCapacity::default).merge(capacity);
        }

        match page.last_evaluated_key {
            Some(cursor) if !cursor.is_empty() => {
                self.last_evaluated_key = Some(cursor);
                true
            },
            _ => {
                self.complete = true;
                false
            },
        }
    }

    /// Cursor to resume from: `None` once the backend has no more pages.
    #[must_use]
    pub fn next_cursor(&self) -> Option<&Key> {
        if self.complete { None } else { self.last_evaluated_key.as_ref() }
    }
}

/// Start cursors of consecutive pages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageCursors {
    /// `cursors[n - 1]` starts page `n`; `cursors[0]` is always `None`.
    pub cursors: Vec<Option<Key>>,
    /// Set when the caller's context ended before the walk finished.
    pub interrupted: Option<ClassifiedError>,
}

fn reached_ceiling(pages: u32, max_pages: Option<u32>) -> bool {
    matches!(max_pages, Some(max) if max > 0 && pages >= max)
}

// A fetch aborted because the caller's context ended (cancelled, or its
// deadline passed) ends the read like an interruption seen between pages. A
// timeout while `ctx` is still live is the page's own window and fails.
fn ends_read(ctx: &CallContext, err: &ClassifiedError) -> bool {
    match err.kind() {
        ErrorKind::Cancelled => true,
        ErrorKind::Timeout => ctx.is_done(),
        _ => false,
    }
}

/// Reads pages via `fetch` until the last page, the page ceiling, or the end
/// of `ctx`. `max_pages` of `None` or `Some(0)` reads every page.
///
/// # Errors
///
/// Returns the first error from `fetch`. The end of `ctx`, whether seen
/// between pages or reported by `fetch`, is not an error; see
/// [`Accumulated::interrupted`].
pub async fn accumulate<F, Fut>(
    ctx: &CallContext,
    start: Option<Key>,
    max_pages: Option<u32>,
    mut fetch: F,
) -> GatewayResult<Accumulated>
where
    F: FnMut(Option<Key>) -> Fut,
    Fut: Future<Output = GatewayResult<Page>>,
{
    let mut acc = Accumulated::default();
    let mut cursor = start;

    loop {
        if let Err(reason) = ctx.check("pagination") {
            tracing::debug!(pages = acc.pages, "pagination interrupted");
            acc.interrupted = Some(reason);
            return Ok(acc);
        }

        let page = match fetch(cursor.take()).await {
            Ok(page) => page,
            Err(err) if ends_read(ctx, &err) => {
                tracing::debug!(pages = acc.pages, error = %err, "page fetch interrupted");
                acc.interrupted = Some(err);
                return Ok(acc);
            },
            Err(err) => return Err(err),
        };
        if !acc.absorb(page) || reached_ceiling(acc.pages, max_pages) {
            return Ok(acc);
        }
        cursor = acc.last_evaluated_key.clone();
    }
}

/// Walks pages via `fetch`, keeping only their start cursors.
///
/// # Errors
///
/// Returns the first error from `fetch`.
pub async fn page_cursors<F, Fut>(
    ctx: &CallContext,
    max_pages: Option<u32>,
    mut fetch: F,
) -> GatewayResult<PageCursors>
where
    F: FnMut(Option<Key>) -> Fut,
    Fut: Future<Output = GatewayResult<Page>>,
{
    let mut result = PageCursors { cursors: vec![None], interrupted: None };
    let mut cursor = None;
    let mut pages = 0u32;

    loop {
        if let Err(reason) = ctx.check("pagination") {
            result.interrupted = Some(reason);
            return Ok(result);
        }

        let page = match fetch(cursor.take()).await {
            Ok(page) => page,
            Err(err) if ends_read(ctx, &err) => {
                result.interrupted = Some(err);
                return Ok(result);
            },
            Err(err) => return Err(err),
        };
        pages += 1;
        match page.last_evaluated_key {
            Some(next) if !next.is_empty() && !reached_ceiling(pages, max_pages) => {
                result.cursors.push(Some(next.clone()));
                cursor = Some(next);
            },
            _ => return Ok(result),
        }
    }
}
