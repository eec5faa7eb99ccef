//! Upstream GraphQL client for clubsync: rate limiting, transport, error
//! classification and cursor pagination over clubs, events and members.

mod api;
mod error;
mod limiter;
pub mod normalize;
mod pager;
mod transport;

pub use api::{ClubApi, UPCOMING_EVENTS_LIMIT};
pub use error::{
    classify_graphql_errors, classify_status, GraphqlError,
    RetryDisposition, UpstreamError,
};
pub use limiter::{RateLimiter, TokenBucketConfig};
pub use pager::{CursorWalk, Page};
pub use transport::{GraphqlClient, GraphqlClientConfig, RetryPolicy};

pub const CRATE_NAME: &str = "clubsync-upstream";
