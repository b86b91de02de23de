//! Parsers for container engine stdout.
//!
//! Parsers never fail on noise: lines that don't match are skipped and an
//! output with no matching lines parses to an empty result.

use std::collections::BTreeSet;

use super::{PortMapping, SessionChunk};
use crate::error::{HubError, HubResult};

/// Parse `ports` output: one `host:container` pair per line.
///
/// Malformed rows are discarded; the result is deduplicated and sorted by
/// container port, then host port.
pub(super) fn parse_ports(stdout: &str) -> Vec<PortMapping> {
    let mut seen = BTreeSet::new();
    for line in stdout.lines() {
        let line = line.trim();
        let Some((host, container)) = line.split_once(':') else {
            continue;
        };
        let (Ok(host_port), Ok(container_port)) =
            (host.trim().parse::<u16>(), container.trim().parse::<u16>())
        else {
            continue;
        };
        seen.insert((container_port, host_port));
    }
    seen.into_iter()
        .map(|(container_port, host_port)| PortMapping {
            host_port,
            container_port,
        })
        .collect()
}

/// Parse `ls` output: blocks with a leading `Name: <container>` line.
pub(super) fn parse_ls(stdout: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in stdout.lines() {
        if let Some(name) = line.trim().strip_prefix("Name: ") {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_owned());
            }
        }
    }
    names
}

/// Parse `base set` output: the last `Base image: <tag>` line.
pub(super) fn parse_base_image(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Base image: "))
        .map(|tag| tag.trim().to_owned())
        .filter(|tag| !tag.is_empty())
        .next_back()
}

/// Parse `repo export` output: the last `Exported <format> -> <path>` line.
pub(super) fn parse_exported_path(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Exported "))
        .filter_map(|rest| rest.split_once(" -> "))
        .map(|(_, path)| path.trim().to_owned())
        .filter(|path| !path.is_empty())
        .next_back()
}

/// Parse `session read --json` output: one JSON object per invocation.
pub(super) fn parse_session_chunk(stdout: &str) -> HubResult<SessionChunk> {
    serde_json::from_str(stdout.trim()).map_err(|e| {
        HubError::EngineFailure {
            message: format!("unparseable session read output: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_sorted_and_deduplicated() {
        let out = "8080:3000\n9090:4000\n8080:3000\n7070:3000\n";
        let ports = parse_ports(out);
        assert_eq!(
            ports,
            vec![
                PortMapping {
                    host_port: 7070,
                    container_port: 3000
                },
                PortMapping {
                    host_port: 8080,
                    container_port: 3000
                },
                PortMapping {
                    host_port: 9090,
                    container_port: 4000
                },
            ]
        );
    }

    #[test]
    fn ports_skips_malformed_rows() {
        let out = "not-a-port\n8080:\n:3000\n65536:1\n8080:3000\n";
        let ports = parse_ports(out);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].host_port, 8080);
    }

    #[test]
    fn ports_empty_on_no_match() {
        assert!(parse_ports("engine warming up\n").is_empty());
        assert!(parse_ports("").is_empty());
    }

    #[test]
    fn ls_dedups_names_in_order() {
        let out = "Name: alpha\nStatus: running\n\nName: beta\nName: alpha\n";
        assert_eq!(parse_ls(out), vec!["alpha".to_owned(), "beta".to_owned()]);
    }

    #[test]
    fn base_image_takes_last_match() {
        let out = "pulling layers...\nBase image: old:1\nBase image: drones/base:42\n";
        assert_eq!(
            parse_base_image(out),
            Some("drones/base:42".to_owned())
        );
    }

    #[test]
    fn base_image_none_without_match() {
        assert_eq!(parse_base_image("done\n"), None);
    }

    #[test]
    fn exported_path_parses() {
        let out = "Packing objects\nExported bundle -> /tmp/export/drone.bundle\n";
        assert_eq!(
            parse_exported_path(out),
            Some("/tmp/export/drone.bundle".to_owned())
        );
    }

    #[test]
    fn session_chunk_parses_json() {
        let chunk =
            parse_session_chunk(r#"{"offsetBytes": 1024, "text": "hello"}"#).expect("parse");
        assert_eq!(chunk.offset_bytes, 1024);
        assert_eq!(chunk.text, "hello");
    }

    #[test]
    fn session_chunk_rejects_garbage() {
        assert!(parse_session_chunk("banner line").is_err());
    }
}
