//! Client-side cache locations (auth tokens, cluster addresses). The files
//! themselves are opaque; only the paths are owned here.

use std::path::PathBuf;

/// `~/.cache/miren/<cluster>`, honoring `XDG_CACHE_HOME`.
pub fn cache_dir(cluster: &str) -> PathBuf {
	let base = std::env::var_os("XDG_CACHE_HOME")
		.map(PathBuf::from)
		.or_else(|| {
			std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache"))
		})
		.unwrap_or_else(|| PathBuf::from(".cache"));
	base.join("miren").join(cluster)
}

/// Cached auth token for a cluster, if one has been saved. Best-effort:
/// staleness is tolerated, absence just means unauthenticated.
pub fn load_token(cluster: &str) -> Option<String> {
	let raw = std::fs::read_to_string(cache_dir(cluster).join("token")).ok()?;
	let token = raw.trim();
	if token.is_empty() {
		None
	} else {
		Some(token.to_owned())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn cache_dir_is_scoped_by_cluster() {
		let dir = cache_dir("prod-eu");
		assert!(dir.ends_with("miren/prod-eu"));
	}
}
