mod client;
mod output;

pub use client::{Client, ClientError};
pub use output::{format_repo, print_sources};
