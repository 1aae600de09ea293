//! # Attribute Namespace
//!
//! Every reserved attribute key the engine reads or writes through a
//! [`crate::metadata::MetadataBackend`], gathered in one place so C4, C6,
//! and C9 all agree on spelling (spec.md §6).

/// Node parent id.
pub const ATTR_PARENT_ID: &str = "parentid";
/// Node name within its parent.
pub const ATTR_NAME: &str = "name";
/// Owning user's opaque id.
pub const ATTR_OWNER_ID: &str = "owner.id";
/// Owning user's identity provider.
pub const ATTR_OWNER_IDP: &str = "owner.idp";
/// Owning user's type.
pub const ATTR_OWNER_TYPE: &str = "owner.type";
/// Node resource type (`file`, `container`, `reference`, `symlink`).
pub const ATTR_TYPE: &str = "type";

/// Id of the blob holding this node's current content.
pub const ATTR_BLOB_ID: &str = "blobid";
/// Size in bytes of the current blob.
pub const ATTR_BLOB_SIZE: &str = "blobsize";

/// Prefix for per-grantee permission grants: `grant.u:<id>` / `grant.g:<id>`.
pub const PREFIX_GRANT: &str = "grant.";
/// Prefix for arbitrary per-file metadata.
pub const PREFIX_MD: &str = "md.";
/// Prefix for per-user favourite flags.
pub const PREFIX_FAV: &str = "fav.";
/// Prefix for checksum attributes (`cs.sha1`, `cs.md5`, `cs.adler32`).
pub const PREFIX_CS: &str = "cs.";

pub const ATTR_CS_SHA1: &str = "cs.sha1";
pub const ATTR_CS_MD5: &str = "cs.md5";
pub const ATTR_CS_ADLER32: &str = "cs.adler32";

/// Cross-space reference, encoded as `cs3:<storage-id>/<node-id>` starting
/// at byte 4.
pub const ATTR_CS3_REF: &str = "cs3.ref";

/// Propagation-boundary flag; presence (any value) marks an ancestor as a
/// stopping point for C6.
pub const ATTR_PROPAGATION: &str = "propagation";
pub const ATTR_TMTIME: &str = "tmtime";
pub const ATTR_TREESIZE: &str = "treesize";
pub const ATTR_DTIME: &str = "dtime";
pub const ATTR_MTIME: &str = "mtime";

pub const ATTR_QUOTA: &str = "quota";
pub const ATTR_SPACE_NAME: &str = "space.name";
pub const ATTR_SPACE_DESCRIPTION: &str = "space.description";
pub const ATTR_SPACE_README: &str = "space.readme";
pub const ATTR_SPACE_IMAGE: &str = "space.image";
pub const ATTR_SPACE_ALIAS: &str = "space.alias";
pub const ATTR_SPACE_TYPE: &str = "space.type";

/// `processing:<upload-id>` while a revision is mid-flight; absent otherwise.
pub const ATTR_NODESTATUS: &str = "nodestatus";
pub const ATTR_SCANSTATUS: &str = "scanstatus";
pub const ATTR_SCANDATE: &str = "scandate";

/// Path the node was located at before being moved to trash.
pub const ATTR_TRASH_ORIGIN: &str = "trash.origin";
/// Cached etag, invalidated whenever mtime changes.
pub const ATTR_TMP_ETAG: &str = "tmp.etag";

/// Name of the literal parent-id value the space root carries.
pub const ROOT_PARENT_ID: &str = "root";

/// Lock token a node is currently held under, if any (checked against an
/// upload session's declared `lockid`, spec.md §4.9).
pub const ATTR_LOCK_ID: &str = "lockid";

/// Reserved name for a node's deleted/processing status value prefix.
pub const NODESTATUS_PROCESSING_PREFIX: &str = "processing:";

/// Default maximum file size (10GiB), mirrored from [`crate::config`] for
/// callers that only need the constant.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default chunk part size for streamed uploads (16MiB, spec.md §4.9).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;
