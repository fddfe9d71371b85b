//! Media type constants for the manifest and blob formats the client speaks.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// OCI image manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image config blob.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// OCI gzip-compressed layer.
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI empty JSON blob, used as the config of pure artifacts.
pub const MEDIA_TYPE_OCI_EMPTY: &str = "application/vnd.oci.empty.v1+json";

/// Docker schema2 manifest.
pub const MEDIA_TYPE_DOCKER2_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema2 manifest list.
pub const MEDIA_TYPE_DOCKER2_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker schema2 config blob.
pub const MEDIA_TYPE_DOCKER2_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Docker schema2 gzip-compressed layer.
pub const MEDIA_TYPE_DOCKER2_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Docker schema1 manifest (legacy, read-only).
pub const MEDIA_TYPE_DOCKER1_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v1+json";

/// Docker schema1 signed manifest (legacy, read-only).
pub const MEDIA_TYPE_DOCKER1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The manifest media types offered in `Accept` headers, preferred first.
pub fn accept_list() -> Vec<&'static str> {
    vec![
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER2_LIST,
        MEDIA_TYPE_DOCKER2_MANIFEST,
        MEDIA_TYPE_DOCKER1_SIGNED,
        MEDIA_TYPE_DOCKER1_MANIFEST,
    ]
}

/// True for index / manifest-list media types.
pub fn is_list_type(media_type: &str) -> bool {
    matches!(media_type, MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER2_LIST)
}

/// True for the legacy schema1 media types, which the client preserves
/// byte-for-byte and never mutates.
pub fn is_legacy_type(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_DOCKER1_MANIFEST | MEDIA_TYPE_DOCKER1_SIGNED
    )
}

/// True for any manifest media type the client can parse.
pub fn is_manifest_type(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_OCI_MANIFEST
            | MEDIA_TYPE_OCI_INDEX
            | MEDIA_TYPE_DOCKER2_MANIFEST
            | MEDIA_TYPE_DOCKER2_LIST
            | MEDIA_TYPE_DOCKER1_MANIFEST
            | MEDIA_TYPE_DOCKER1_SIGNED
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
