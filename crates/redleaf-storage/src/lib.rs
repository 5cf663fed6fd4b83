//! Collaborators at the edge of the sync engine: page fetch, raw page archive,
//! record/subscriber/notice persistence and outbound email.

mod archive;
mod fetch;
mod mail;
mod memory;
mod postgres;
mod store;

pub use archive::{ArchivedPage, RawArchive};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage, Fetcher,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use mail::{DryRunMailer, MailError, Mailer, OutboundEmail, ResendMailer};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{NoticeStore, RecordStore, StoreError, SubscriberStore};

pub const CRATE_NAME: &str = "redleaf-storage";
