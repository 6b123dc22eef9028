use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
    #[serde(default)]
    pub sort: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: DEFAULT_PAGE_SIZE,
            sort: None,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.max(1),
            sort: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub size: u32,
    #[serde(rename = "totalElements")]
    pub total_elements: u64,
    #[serde(rename = "totalPages")]
    pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub elements: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    pub fn new(elements: Vec<T>, pagination: Pagination) -> Self {
        Self {
            elements,
            pagination,
        }
    }
}

/// Paging state of one detail poller binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor<T> {
    request: PageRequest,
    last_page: Option<Page<T>>,
    first_fetch: bool,
}

impl<T> Default for PageCursor<T> {
    fn default() -> Self {
        Self {
            request: PageRequest::default(),
            last_page: None,
            first_fetch: true,
        }
    }
}

impl<T: Clone> PageCursor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The window automatic polls re-request.
    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    pub fn last_page(&self) -> Option<&Page<T>> {
        self.last_page.as_ref()
    }

    pub fn is_first_fetch(&self) -> bool {
        self.first_fetch
    }

    /// Makes `request` the baseline for subsequent automatic polls.
    pub fn rebase(&mut self, request: PageRequest) {
        self.request = request;
    }

    /// Starts over for a different resource; the next fetch counts as the first one.
    pub fn rebind(&mut self, request: PageRequest) {
        self.request = request;
        self.last_page = None;
        self.first_fetch = true;
    }

    pub fn record(&mut self, page: Page<T>) {
        self.last_page = Some(page);
        self.first_fetch = false;
    }

    pub fn record_failure(&mut self) {
        self.first_fetch = false;
    }
}
