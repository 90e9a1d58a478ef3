pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn first(size: u32) -> PageRequest {
        PageRequest { page: 0, size }
    }

    pub fn next(self) -> PageRequest {
        PageRequest {
            page: self.page + 1,
            size: self.size,
        }
    }
}

impl Default for PageRequest {
    fn default() -> PageRequest {
        PageRequest::first(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub total_pages: u32,

    /// Highest event sequence number already reflected in this page
    pub seq: u64,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.page + 1 >= self.total_pages
    }
}
