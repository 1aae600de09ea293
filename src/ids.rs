//! # Identifier Sharding
//!
//! `Pathify` splits a node or space id into fixed-width segments so that no
//! single directory on disk ever holds more than a bounded number of
//! entries, the same fan-out trick content-addressable stores and FUSE
//! inode tables use to keep directory listings cheap.

/// Splits the first `depth * width` characters of `id` into `depth`
/// segments of `width` characters each, separated by `/`; any remaining
/// characters are appended unsegmented.
///
/// `Pathify` is a bijection on ids of length `>= depth * width`: removing
/// the inserted `/` separators reconstructs `id` exactly.
///
/// # Examples
///
/// ```
/// use storage_engine::ids::pathify;
/// assert_eq!(pathify("aabbccddee", 4, 2), "aa/bb/cc/dd/ee");
/// assert_eq!(pathify("ab", 1, 2), "ab");
/// ```
pub fn pathify(id: &str, depth: usize, width: usize) -> String {
    let shard_chars = depth * width;
    let bytes = id.as_bytes();

    if bytes.len() < shard_chars {
        return id.to_string();
    }

    let mut out = String::with_capacity(id.len() + depth);
    for i in 0..depth {
        if i > 0 {
            out.push('/');
        }
        out.push_str(&id[i * width..(i + 1) * width]);
    }
    let rest = &id[shard_chars..];
    if !rest.is_empty() {
        out.push('/');
        out.push_str(rest);
    }
    out
}

/// Sharded relative path for a node id: 4 segments of width 2
/// (spec.md §4.4).
pub fn node_shard_path(node_id: &str) -> String {
    pathify(node_id, 4, 2)
}

/// Sharded relative path for a space id: 1 segment of width 2
/// (spec.md §4.4).
pub fn space_shard_path(space_id: &str) -> String {
    pathify(space_id, 1, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pathify_splits_requested_depth_and_width() {
        let id = "0123456789abcdef01234567";
        assert_eq!(pathify(id, 4, 2), "01/23/45/67/89abcdef01234567");
    }

    #[test]
    fn pathify_is_noop_on_short_ids() {
        assert_eq!(pathify("a", 4, 2), "a");
    }

    #[test]
    fn pathify_removing_slashes_reconstructs_id() {
        let id = "a1b2c3d4e5f6g7h8i9j0k1l2";
        let shredded = pathify(id, 4, 2);
        assert_eq!(shredded.replace('/', ""), id);
    }

    #[test]
    fn node_shard_path_uses_four_segments_of_two() {
        let id = "1234567890abcdef12345678";
        assert_eq!(node_shard_path(id), "12/34/56/78/90abcdef12345678");
    }

    #[test]
    fn space_shard_path_uses_one_segment_of_two() {
        let id = "11111111-1111-1111-1111-111111111111";
        assert_eq!(
            space_shard_path(id),
            "11/111111-1111-1111-1111-111111111111"
        );
    }
}
