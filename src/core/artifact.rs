//! Standalone rule artifact
//!
//! [`render`] produces a self-executable `nft -f` definition of the whole
//! desired state: both port sets and the three base chains. The text is a pure
//! function of the port *sets*, so reordered or duplicated input renders
//! byte-identical output.
//!
//! [`publish`] writes it to `<base_dir>/rules/firewall.rules` through a sibling
//! temporary file and a rename, so readers only ever see a complete artifact.

use crate::core::error::{Error, Result};
use crate::core::objects::{
    ChainPolicy, SetSpec, baseline_chains, set_accept_needle, write_set_block,
};
use crate::core::service::Protocol;
use ipnetwork::{IpNetwork, Ipv4Network};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SHEBANG: &str = "#!/usr/sbin/nft -f";

/// Subdirectories of the base directory created on every publish
pub const REQUIRED_DIRS: [&str; 3] = ["rules", "logs", "data"];

pub const ARTIFACT_FILE: &str = "firewall.rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub lan_cidr: IpNetwork,
    pub policy: ChainPolicy,
    pub allow_icmp: bool,
}

/// `192.168.1.0/24`
pub fn default_lan_cidr() -> IpNetwork {
    let network = Ipv4Addr::new(192, 168, 1, 0);
    Ipv4Network::new(network, 24).map_or(IpNetwork::V4(network.into()), IpNetwork::V4)
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            lan_cidr: default_lan_cidr(),
            policy: ChainPolicy::Drop,
            allow_icmp: true,
        }
    }
}

/// Renders the artifact text for the given ports.
pub fn render(
    tcp_ports: impl IntoIterator<Item = u16>,
    udp_ports: impl IntoIterator<Item = u16>,
    opts: &RenderOptions,
) -> String {
    let tcp: Vec<u16> = tcp_ports.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    let udp: Vec<u16> = udp_ports.into_iter().collect::<BTreeSet<_>>().into_iter().collect();

    let mut out = String::new();
    let _ = writeln!(out, "{SHEBANG}");
    let _ = writeln!(out, "table inet filter {{");

    for (protocol, ports) in [(Protocol::Tcp, &tcp), (Protocol::Udp, &udp)] {
        write_set_block(&mut out, &SetSpec::for_protocol(protocol), ports, "  ", "");
        out.push('\n');
    }

    let [input, forward, output] = baseline_chains(opts.policy);

    let _ = writeln!(out, "  chain input {{");
    let _ = writeln!(out, "    {}", input.header());
    let _ = writeln!(out, "    ct state established,related accept");
    let _ = writeln!(out, "    iif \"lo\" accept");
    let family = match opts.lan_cidr {
        IpNetwork::V4(_) => "ip",
        IpNetwork::V6(_) => "ip6",
    };
    let _ = writeln!(out, "    {family} saddr {} accept", opts.lan_cidr);
    out.push('\n');
    for protocol in [Protocol::Tcp, Protocol::Udp] {
        let _ = writeln!(out, "    {}", set_accept_needle(protocol));
    }
    if opts.allow_icmp {
        let _ = writeln!(out, "    icmp type echo-request accept");
    }
    let _ = writeln!(out, "  }}");
    out.push('\n');

    for chain in [forward, output] {
        let _ = writeln!(out, "  chain {} {{ {} }}", chain.name, chain.header());
    }
    let _ = writeln!(out, "}}");
    out
}

/// A successfully published artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedArtifact {
    pub path: PathBuf,
    /// Hex SHA-256 of the written text
    pub sha256: String,
}

pub fn artifact_path(base_dir: &Path) -> PathBuf {
    base_dir.join("rules").join(ARTIFACT_FILE)
}

/// Hex SHA-256 of artifact text
pub fn checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Atomically replaces `<base_dir>/rules/firewall.rules` with `text`.
///
/// Creates the required subdirectories plus `extra_dirs`. The file is written
/// as 0644 and marked owner-executable after the rename.
///
/// # Errors
///
/// Returns [`Error::ArtifactWrite`] naming the path that failed. The previous
/// artifact is left untouched on any failure before the rename.
pub fn publish(base_dir: &Path, text: &str, extra_dirs: &[&str]) -> Result<PublishedArtifact> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| Error::ArtifactWrite { path, source }
    };

    for dir in REQUIRED_DIRS.iter().chain(extra_dirs) {
        let dir = base_dir.join(dir);
        std::fs::create_dir_all(&dir).map_err(write_err(&dir))?;
    }

    let rules_dir = base_dir.join("rules");
    let target = artifact_path(base_dir);

    let mut temp = tempfile::Builder::new()
        .prefix(".firewall.rules.")
        .suffix(".tmp")
        .tempfile_in(&rules_dir)
        .map_err(write_err(&rules_dir))?;
    temp.write_all(text.as_bytes())
        .map_err(write_err(temp.path()))?;
    temp.as_file().sync_all().map_err(write_err(temp.path()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(write_err(temp.path()))?;
    }

    temp.persist(&target)
        .map_err(|e| Error::ArtifactWrite {
            path: target.clone(),
            source: e.error,
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&target)
            .map_err(write_err(&target))?
            .permissions()
            .mode();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode | 0o100))
            .map_err(write_err(&target))?;
    }

    let sha256 = checksum(text);
    info!("Published {} ({})", target.display(), &sha256[..12]);
    Ok(PublishedArtifact {
        path: target,
        sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_render_sorts_and_dedups() {
        let opts = RenderOptions::default();
        let a = render([80, 22], [], &opts);
        let b = render([22, 80, 22], [], &opts);
        assert_eq!(a, b);
        assert!(a.contains("elements = { 22, 80 }"));
    }

    #[test]
    fn test_render_full_text() {
        let text = render([22], [53], &RenderOptions::default());
        let expected = "\
#!/usr/sbin/nft -f
table inet filter {
  set tcp_services {
    type inet_service
    flags interval
    elements = { 22 }
  }

  set udp_services {
    type inet_service
    flags interval
    elements = { 53 }
  }

  chain input {
    type filter hook input priority 0; policy drop;
    ct state established,related accept
    iif \"lo\" accept
    ip saddr 192.168.1.0/24 accept

    tcp dport @tcp_services accept
    udp dport @udp_services accept
    icmp type echo-request accept
  }

  chain forward { type filter hook forward priority 0; policy accept; }
  chain output { type filter hook output priority 0; policy accept; }
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_render_empty_sets_have_no_elements_line() {
        let text = render([], [], &RenderOptions::default());
        assert!(!text.contains("elements"));
        assert!(text.contains("set tcp_services {"));
        assert!(text.contains("set udp_services {"));
    }

    #[test]
    fn test_render_input_rule_order() {
        let text = render([443], [], &RenderOptions::default());
        let order = [
            "ct state established,related accept",
            "iif \"lo\" accept",
            "ip saddr 192.168.1.0/24 accept",
            "tcp dport @tcp_services accept",
            "udp dport @udp_services accept",
            "icmp type echo-request accept",
        ];
        let positions: Vec<usize> = order.iter().map(|r| text.find(r).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_render_options() {
        let opts = RenderOptions {
            lan_cidr: "fd00::/64".parse().unwrap(),
            policy: ChainPolicy::Accept,
            allow_icmp: false,
        };
        let text = render([], [], &opts);
        assert!(text.contains("ip6 saddr fd00::/64 accept"));
        assert!(text.contains("hook input priority 0; policy accept;"));
        assert!(!text.contains("icmp"));
    }

    #[test]
    fn test_publish_creates_dirs_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        let text = render([22], [], &RenderOptions::default());

        let published = publish(dir.path(), &text, &["config"]).unwrap();

        for sub in ["rules", "logs", "data", "config"] {
            assert!(dir.path().join(sub).is_dir());
        }
        assert_eq!(published.path, dir.path().join("rules/firewall.rules"));
        assert_eq!(std::fs::read_to_string(&published.path).unwrap(), text);
        assert_eq!(published.sha256, checksum(&text));
        assert_eq!(published.sha256.len(), 64);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&published.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o744);
        }

        // No temporary siblings left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("rules")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_publish_replaces_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let opts = RenderOptions::default();
        publish(dir.path(), &render([22], [], &opts), &[]).unwrap();
        let second = render([22, 443], [], &opts);
        let published = publish(dir.path(), &second, &[]).unwrap();
        assert_eq!(std::fs::read_to_string(published.path).unwrap(), second);
    }

    #[test]
    fn test_publish_failure_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the base directory should be
        let blocker = dir.path().join("base");
        std::fs::write(&blocker, "x").unwrap();

        let err = publish(&blocker, "text", &[]).unwrap_err();
        match err {
            Error::ArtifactWrite { path, .. } => assert!(path.starts_with(&blocker)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn prop_render_depends_only_on_port_sets(
            tcp in proptest::collection::vec(any::<u16>(), 0..20),
            udp in proptest::collection::vec(any::<u16>(), 0..20),
        ) {
            let opts = RenderOptions::default();
            let mut tcp_shuffled = tcp.clone();
            tcp_shuffled.reverse();
            tcp_shuffled.extend(tcp.iter().take(3));
            let mut udp_shuffled = udp.clone();
            udp_shuffled.reverse();

            prop_assert_eq!(
                render(tcp.clone(), udp.clone(), &opts),
                render(tcp_shuffled, udp_shuffled, &opts)
            );
        }
    }
}
