use std::collections::HashSet;
use std::path::Path;

use crate::models::{HostTarget, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};

/// Build the ordered target set from the literal list and/or hosts file.
/// Literal targets come first, then file targets; duplicates keep their
/// first occurrence.
pub fn resolve_targets(
    literal: Option<&str>,
    hosts_file: Option<&Path>,
) -> Result<Vec<HostTarget>, String> {
    let mut targets = Vec::new();
    let mut seen = HashSet::new();

    if let Some(list) = literal {
        for raw in list.split_whitespace() {
            push_unique(&mut targets, &mut seen, parse_target(raw)?);
        }
    }

    if let Some(path) = hosts_file {
        let content = std::fs::read_to_string(path).map_err(|error| {
            format!("Failed to read hosts file `{}`: {error}", path.display())
        })?;
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let target = parse_target(trimmed)
                .map_err(|message| format!("{}:{}: {message}", path.display(), index + 1))?;
            push_unique(&mut targets, &mut seen, target);
        }
    }

    Ok(targets)
}

fn push_unique(targets: &mut Vec<HostTarget>, seen: &mut HashSet<HostTarget>, target: HostTarget) {
    if seen.insert(target.clone()) {
        targets.push(target);
    }
}

pub fn parse_target(raw: &str) -> Result<HostTarget, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    let (user, rest) = match raw.split_once('@') {
        Some((user, rest)) => {
            if user.is_empty() {
                return Err(format!("Empty user in target `{raw}`"));
            }
            (user.to_string(), rest)
        }
        None => (DEFAULT_SSH_USER.to_string(), raw),
    };

    let (host, port) = split_host_port(rest, raw)?;
    if host.is_empty() {
        return Err(format!("Empty host in target `{raw}`"));
    }
    Ok(HostTarget::new(user, host, port))
}

fn split_host_port(rest: &str, raw: &str) -> Result<(String, u16), String> {
    if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6: `[::1]` or `[::1]:2222`.
        let Some((host, tail)) = stripped.split_once(']') else {
            return Err(format!("Unclosed `[` in target `{raw}`"));
        };
        let port = if tail.is_empty() {
            DEFAULT_SSH_PORT
        } else if let Some(port_text) = tail.strip_prefix(':') {
            parse_port(port_text, raw)?
        } else {
            return Err(format!("Unexpected text after `]` in target `{raw}`"));
        };
        return Ok((host.to_string(), port));
    }

    // A single colon separates host and port; more than one means a bare
    // IPv6 address.
    if rest.matches(':').count() == 1 {
        let (host, port_text) = rest.split_once(':').expect("single colon should split");
        return Ok((host.to_string(), parse_port(port_text, raw)?));
    }
    Ok((rest.to_string(), DEFAULT_SSH_PORT))
}

fn parse_port(port_text: &str, raw: &str) -> Result<u16, String> {
    let port = port_text
        .parse::<u16>()
        .map_err(|error| format!("Invalid port in target `{raw}`: {error}"))?;
    if port == 0 {
        return Err(format!("Port must be greater than 0 in target `{raw}`"));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{parse_target, resolve_targets};
    use crate::models::HostTarget;

    fn write_temp_hosts_file(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "kube-fleet-reset-hosts-{}.txt",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, content).expect("temp hosts file should be writable");
        path
    }

    #[test]
    fn parse_target_accepts_all_address_forms() {
        assert_eq!(
            parse_target("node-1").unwrap(),
            HostTarget::new("root", "node-1", 22)
        );
        assert_eq!(
            parse_target("admin@node-1").unwrap(),
            HostTarget::new("admin", "node-1", 22)
        );
        assert_eq!(
            parse_target("node-1:2222").unwrap(),
            HostTarget::new("root", "node-1", 2222)
        );
        assert_eq!(
            parse_target("admin@[fd00::7]:2222").unwrap(),
            HostTarget::new("admin", "fd00::7", 2222)
        );
        assert_eq!(
            parse_target("fd00::7").unwrap(),
            HostTarget::new("root", "fd00::7", 22)
        );
    }

    #[test]
    fn parse_target_rejects_malformed_input() {
        assert!(parse_target("").is_err());
        assert!(parse_target("@node-1").is_err());
        assert!(parse_target("node-1:0").is_err());
        assert!(parse_target("node-1:notaport").is_err());
        assert!(parse_target("[fd00::7").is_err());
    }

    #[test]
    fn literal_list_resolves_in_order_with_duplicates_dropped() {
        let targets = resolve_targets(Some("a b a c"), None).unwrap();
        let hosts: Vec<&str> = targets.iter().map(|target| target.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[test]
    fn hosts_file_skips_blanks_and_comments_and_keeps_order() {
        let path = write_temp_hosts_file("# fleet\nnode-1\n\n  node-2  \n# tail\nadmin@node-3\n");
        let targets = resolve_targets(None, Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        let labels: Vec<String> = targets.iter().map(|target| target.label()).collect();
        assert_eq!(labels, vec!["node-1", "node-2", "admin@node-3"]);
    }

    #[test]
    fn hosts_file_errors_carry_the_line_number() {
        let path = write_temp_hosts_file("node-1\nnode-2:bogus\n");
        let error = resolve_targets(None, Some(&path)).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(error.contains(":2:"));
        assert!(error.contains("Invalid port"));
    }

    #[test]
    fn empty_hosts_file_resolves_to_an_empty_set() {
        let path = write_temp_hosts_file("");
        let targets = resolve_targets(None, Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(targets.is_empty());
    }

    #[test]
    fn literal_and_file_targets_merge_in_order() {
        let path = write_temp_hosts_file("node-2\nnode-3\n");
        let targets = resolve_targets(Some("node-1 node-2"), Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        let hosts: Vec<&str> = targets.iter().map(|target| target.host.as_str()).collect();
        assert_eq!(hosts, vec!["node-1", "node-2", "node-3"]);
    }

    #[test]
    fn missing_hosts_file_is_an_error() {
        let error = resolve_targets(None, Some(std::path::Path::new("/nonexistent/hosts.txt")))
            .unwrap_err();
        assert!(error.contains("Failed to read hosts file"));
    }
}
