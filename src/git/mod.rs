//! Git subprocess helpers, the GitHub REST client, and the issue poller.

pub mod github;
pub mod poller;
pub mod repo;
