//! Deterministic instance naming: `{cluster}-{role}-{index}`.

/// Build the identity string for one instance of a role.
pub fn make_id(cluster: &str, role: &str, index: u32) -> String {
    format!("{cluster}-{role}-{index}")
}

/// Split an identity back into `(cluster, role, index)`.
///
/// The first segment is the cluster and the last is the index; whatever sits
/// between is the role. Returns `None` when there are fewer than three
/// segments or the index is not an integer. Round-trips only when the cluster
/// name has no hyphen, which is why cluster names are rejected at the CLI.
pub fn parse_id(id: &str) -> Option<(String, String, u32)> {
    let (cluster, rest) = id.split_once('-')?;
    let (role, index) = rest.rsplit_once('-')?;
    if cluster.is_empty() || role.is_empty() {
        return None;
    }
    let index = index.parse().ok()?;
    Some((cluster.to_string(), role.to_string(), index))
}

/// Check that a cluster or role name survives the identity round-trip.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
