//! Repository URL parsing.

use anyhow::{anyhow, Result};

/// Extract `(owner, repo)` from a GitHub-style repository URL. A trailing
/// `.git` is stripped.
pub fn parse_repository_url(repository_url: &str) -> Result<(String, String)> {
    let rest = repository_url
        .strip_prefix("https://")
        .or_else(|| repository_url.strip_prefix("http://"))
        .ok_or_else(|| anyhow!("invalid repository url '{repository_url}': missing scheme"))?;

    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let _host = segments
        .next()
        .ok_or_else(|| anyhow!("invalid repository url '{repository_url}': missing host"))?;
    let owner = segments
        .next()
        .ok_or_else(|| anyhow!("invalid repository url '{repository_url}': missing owner"))?;
    let repo = segments
        .next()
        .ok_or_else(|| anyhow!("invalid repository url '{repository_url}': missing repo"))?;

    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return Err(anyhow!("invalid repository url '{repository_url}'"));
    }
    Ok((owner.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_git_suffixed_urls() {
        assert_eq!(
            parse_repository_url("https://github.com/test-org/repo-a").unwrap(),
            ("test-org".into(), "repo-a".into())
        );
        assert_eq!(
            parse_repository_url("https://github.com/test-org/repo-a.git").unwrap(),
            ("test-org".into(), "repo-a".into())
        );
        assert_eq!(
            parse_repository_url("http://ghe.internal/team/tool/extra").unwrap(),
            ("team".into(), "tool".into())
        );
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse_repository_url("github.com/a/b").is_err());
        assert!(parse_repository_url("https://github.com/onlyowner").is_err());
        assert!(parse_repository_url("https://").is_err());
        assert!(parse_repository_url("").is_err());
    }
}
