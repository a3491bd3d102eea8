//! Plain-text rendering for CLI commands.

use crate::driver::RemoteRepo;
use crate::source::SourceStatus;

/// One line per candidate: `source id name  description`.
pub fn format_repo(source: &str, repo: &RemoteRepo) -> String {
    let mut line = format!("{:<12} {:<12} {}", source, repo.id, repo.name);
    if !repo.description.is_empty() {
        line.push_str("  ");
        line.push_str(&repo.description);
    }
    line
}

pub fn print_sources(sources: &[SourceStatus]) {
    if sources.is_empty() {
        println!("No sources configured");
        return;
    }

    println!("{:<12} {:<30} {}", "SOURCE", "CLONE DIRECTORY", "STATUS");
    println!("{}", "-".repeat(80));

    for source in sources {
        println!(
            "{:<12} {:<30} {}",
            source.name, source.clone_directory, source.status
        );
        if !source.description.is_empty() {
            println!("{:<12} {}", "", source.description);
        }
    }
}
