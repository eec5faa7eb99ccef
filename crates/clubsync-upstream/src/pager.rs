use std::future::Future;

use crate::UpstreamError;

/// One page of a cursor-paginated collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

/// Position in a cursor-paginated collection. Cursors are opaque and only
/// ever round-tripped.
///
/// `step` fetches exactly one page and hands control back so the caller can
/// checkpoint before asking for the next one. A failed fetch leaves the
/// position untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorWalk {
    cursor: Option<String>,
    exhausted: bool,
}

impl CursorWalk {
    pub fn resume(cursor: Option<String>) -> Self {
        Self {
            cursor,
            exhausted: false,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn into_cursor(self) -> Option<String> {
        self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub async fn step<T, F, Fut>(&mut self, fetch: F) -> Result<Vec<T>, UpstreamError>
    where
        F: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = Result<Page<T>, UpstreamError>>,
    {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let page = fetch(self.cursor.clone()).await?;
        match (page.has_next_page, page.end_cursor) {
            (true, Some(next)) => self.cursor = Some(next),
            // A next page without a cursor to reach it cannot be followed.
            (true, None) => self.exhausted = true,
            (false, end) => {
                if end.is_some() {
                    self.cursor = end;
                }
                self.exhausted = true;
            }
        }
        Ok(page.items)
    }

    /// Walk to the end of the collection, collecting every item.
    pub async fn drain<T, F, Fut>(&mut self, mut fetch: F) -> Result<Vec<T>, UpstreamError>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<Page<T>, UpstreamError>>,
    {
        let mut items = Vec::new();
        while !self.exhausted {
            items.extend(self.step(&mut fetch).await?);
        }
        Ok(items)
    }
}
