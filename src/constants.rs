// Centralized constants for ocibake to avoid magic numbers

/// Permission bits for declared files that do not set `mode`
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Gzip level used for every produced layer (flate2 best compression)
pub const LAYER_COMPRESSION_LEVEL: u32 = 9;

/// Bytes of an unsuccessful archive response kept for the error message
pub const FETCH_DIAGNOSTIC_LIMIT: u64 = 4 * 1024;

/// Chunk size used when streaming archives (64 KiB)
pub const FETCH_CHUNK_SIZE: usize = 64 * 1024;

/// Default timeout for registry and archive requests in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Default maximum number of retry attempts for registry calls made by the CLI
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default initial backoff for requests in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff limit in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Platform picked out of an image index when the base is multi-arch
pub const DEFAULT_OS: &str = "linux";
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_NONDISTRIBUTABLE_LAYER_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Accept header sent when asking a registry for a manifest
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json";

/// Prefix of history entries recorded for appended layers
pub const HISTORY_CREATED_BY: &str = "ocibake";

/// Top-level runtime config fields an override may set. Covers the OCI
/// image config plus the Docker fields registries commonly carry.
pub const RUNTIME_CONFIG_FIELDS: &[&str] = &[
    "User",
    "ExposedPorts",
    "Env",
    "Entrypoint",
    "Cmd",
    "Volumes",
    "WorkingDir",
    "Labels",
    "StopSignal",
    "ArgsEscaped",
    "Healthcheck",
    "OnBuild",
    "Shell",
    "Hostname",
    "Domainname",
    "Image",
    "AttachStdin",
    "AttachStdout",
    "AttachStderr",
    "Tty",
    "OpenStdin",
    "StdinOnce",
    "NetworkDisabled",
    "MacAddress",
    "StopTimeout",
    "Memory",
    "MemorySwap",
    "CpuShares",
];
