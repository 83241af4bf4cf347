use crate::models::{AclPolicy, AclState};
use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use std::{env, fmt, str::FromStr, time::Duration};

pub const DEFAULT_SIGNED_URL_EXPIRY_SECS: u64 = 3600;
pub const DEFAULT_CACHE_WINDOW_SECS: u64 = 1800;
pub const DEFAULT_MARKER_TTL_SECS: u64 = 300;
pub const DEFAULT_JOB_TTL_SECS: u64 = 24 * 60 * 60;
/// S3 refuses presigned URLs valid for longer than seven days.
const MAX_SIGNED_URL_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;
/// Leaves at least one whole second of cached URL lifetime below the expiry.
const MIN_SIGNED_URL_EXPIRY_SECS: u64 = 2;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Centralized configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct FilestoreConfig {
    pub store: StoreSettings,
    /// Prefix for every key this deployment writes.
    pub storage_path: String,
    /// Policy for current objects.
    pub acl: AclPolicy,
    /// Policy for objects left behind by re-uploads.
    pub non_current_acl: AclPolicy,
    pub signed_url_expiry: Duration,
    /// Cache window; zero disables caching.
    pub cache_window: Duration,
    pub marker_ttl: Duration,
    pub download_proxy: Option<String>,
    /// Content types served inline instead of as attachments.
    pub inline_content_types: Vec<String>,
    pub check_access_on_startup: bool,
    pub redis_url: Option<String>,
    pub cache_prefix: String,
    pub queue: QueueSettings,
    pub catalog: Option<CatalogSettings>,
    pub capabilities: HostCapabilities,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub bucket: String,
    pub region: String,
    pub credentials: CredentialMode,
    /// Custom endpoint (MinIO, Ceph, ...). AWS when unset.
    pub endpoint: Option<String>,
    pub addressing_style: AddressingStyle,
    /// Resolved from `addressing_style` once, at load time.
    pub path_style: bool,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

#[derive(Clone)]
pub enum CredentialMode {
    Static {
        access_key_id: String,
        secret_access_key: String,
    },
    /// Instance role / environment credential chain.
    Ambient,
}

impl fmt::Debug for CredentialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialMode::Static { access_key_id, .. } => f
                .debug_struct("Static")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
            CredentialMode::Ambient => f.write_str("Ambient"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingStyle {
    Path,
    Virtual,
    Auto,
}

impl FromStr for AddressingStyle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" => Ok(AddressingStyle::Path),
            "virtual" => Ok(AddressingStyle::Virtual),
            "auto" => Ok(AddressingStyle::Auto),
            other => Err(anyhow!("unknown addressing style `{other}` (expected path, virtual or auto)")),
        }
    }
}

impl AddressingStyle {
    /// `auto` picks path style for SigV4 unless a download proxy rewrites
    /// hosts, in which case the bucket has to live in the host name.
    pub fn resolve(self, has_download_proxy: bool) -> bool {
        match self {
            AddressingStyle::Path => true,
            AddressingStyle::Virtual => false,
            AddressingStyle::Auto => !has_download_proxy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub job_ttl: Duration,
    pub failure_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub site_url: String,
    pub api_token: Option<String>,
}

/// Host-framework capabilities, resolved once at startup and passed down.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCapabilities {
    /// Missing objects may be served from the local filestore instead.
    pub filesystem_fallback: bool,
    /// Visibility changes go through the job queue.
    pub async_visibility_update: bool,
}

/// Command-line overrides for the environment configuration.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Bucket name (overrides S3FILESTORE_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Region (overrides S3FILESTORE_REGION)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Custom S3 endpoint (overrides S3FILESTORE_HOST_NAME)
    #[arg(long, global = true)]
    pub host_name: Option<String>,

    /// Key prefix (overrides S3FILESTORE_STORAGE_PATH)
    #[arg(long, global = true)]
    pub storage_path: Option<String>,

    /// ACL policy for current objects (overrides S3FILESTORE_ACL)
    #[arg(long, global = true)]
    pub acl: Option<String>,

    /// ACL policy for non-current objects (overrides S3FILESTORE_NON_CURRENT_ACL)
    #[arg(long, global = true)]
    pub non_current_acl: Option<String>,

    /// Redis URL for the cache and job queue (overrides S3FILESTORE_REDIS_URL)
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// CKAN site URL (overrides CKAN_SITE_URL)
    #[arg(long, global = true)]
    pub ckan_url: Option<String>,
}

impl FilestoreConfig {
    /// Parse environment variables + CLI overrides.
    pub fn from_env_and_args(args: &ConfigArgs) -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok(), args)
    }

    /// Build from any variable source; `from_env_and_args` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F, args: &ConfigArgs) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str, arg: &Option<String>| {
            arg.clone()
                .or_else(|| var(name))
                .with_context(|| format!("{name} is not configured"))
        };

        let bucket = required("S3FILESTORE_BUCKET", &args.bucket)?;
        validate_bucket_name(&bucket).map_err(|reason| anyhow!("bucket `{bucket}` invalid: {reason}"))?;
        let region = required("S3FILESTORE_REGION", &args.region)?;

        let signature = var("S3FILESTORE_SIGNATURE_VERSION")
            .context("S3FILESTORE_SIGNATURE_VERSION is not configured")?;
        if !matches!(signature.trim().to_ascii_lowercase().as_str(), "s3v4" | "v4") {
            bail!("signature version `{signature}` is not supported; use s3v4");
        }

        let credentials = if parse_bool(&var, "S3FILESTORE_USE_AMBIENT_ROLE", false)? {
            CredentialMode::Ambient
        } else {
            CredentialMode::Static {
                access_key_id: var("S3FILESTORE_ACCESS_KEY_ID")
                    .context("S3FILESTORE_ACCESS_KEY_ID is not configured")?,
                secret_access_key: var("S3FILESTORE_SECRET_ACCESS_KEY")
                    .context("S3FILESTORE_SECRET_ACCESS_KEY is not configured")?,
            }
        };

        let download_proxy = var("S3FILESTORE_DOWNLOAD_PROXY")
            .map(|p| p.trim_end_matches('/').to_string());
        if let Some(proxy) = &download_proxy {
            url::Url::parse(proxy)
                .with_context(|| format!("parsing S3FILESTORE_DOWNLOAD_PROXY value `{proxy}`"))?;
        }

        let addressing_style: AddressingStyle = var("S3FILESTORE_ADDRESSING_STYLE")
            .unwrap_or_else(|| "auto".into())
            .parse()?;

        let signed_url_expiry = parse_secs(&var, "S3FILESTORE_SIGNED_URL_EXPIRY", DEFAULT_SIGNED_URL_EXPIRY_SECS)?;
        if !(MIN_SIGNED_URL_EXPIRY_SECS..=MAX_SIGNED_URL_EXPIRY_SECS).contains(&signed_url_expiry.as_secs()) {
            bail!(
                "S3FILESTORE_SIGNED_URL_EXPIRY must be between {MIN_SIGNED_URL_EXPIRY_SECS} and {MAX_SIGNED_URL_EXPIRY_SECS} seconds"
            );
        }

        let acl = parse_policy(args.acl.clone().or_else(|| var("S3FILESTORE_ACL")), AclState::Public)
            .context("parsing S3FILESTORE_ACL")?;
        let non_current_acl = parse_policy(
            args.non_current_acl
                .clone()
                .or_else(|| var("S3FILESTORE_NON_CURRENT_ACL")),
            AclState::Private,
        )
        .context("parsing S3FILESTORE_NON_CURRENT_ACL")?;

        let inline_content_types = var("S3FILESTORE_INLINE_CONTENT_TYPES")
            .unwrap_or_else(|| "application/pdf".into())
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let catalog = args
            .ckan_url
            .clone()
            .or_else(|| var("CKAN_SITE_URL"))
            .map(|site_url| CatalogSettings {
                site_url: site_url.trim_end_matches('/').to_string(),
                api_token: var("CKAN_API_TOKEN"),
            });

        Ok(Self {
            store: StoreSettings {
                bucket,
                region,
                credentials,
                endpoint: args
                    .host_name
                    .clone()
                    .or_else(|| var("S3FILESTORE_HOST_NAME"))
                    .map(|endpoint| normalize_endpoint(&endpoint)),
                addressing_style,
                path_style: addressing_style.resolve(download_proxy.is_some()),
                connect_timeout: parse_millis(&var, "S3FILESTORE_CONNECT_TIMEOUT_MS", 3_000)?,
                operation_timeout: parse_millis(&var, "S3FILESTORE_OPERATION_TIMEOUT_MS", 30_000)?,
            },
            storage_path: args
                .storage_path
                .clone()
                .or_else(|| var("S3FILESTORE_STORAGE_PATH"))
                .unwrap_or_default(),
            acl,
            non_current_acl,
            signed_url_expiry,
            cache_window: parse_secs(&var, "S3FILESTORE_SIGNED_URL_CACHE_WINDOW", DEFAULT_CACHE_WINDOW_SECS)?,
            marker_ttl: parse_secs(&var, "S3FILESTORE_VISIBILITY_MARKER_TTL", DEFAULT_MARKER_TTL_SECS)?,
            download_proxy,
            inline_content_types,
            check_access_on_startup: parse_bool(&var, "S3FILESTORE_CHECK_ACCESS_ON_STARTUP", true)?,
            redis_url: args.redis_url.clone().or_else(|| var("S3FILESTORE_REDIS_URL")),
            cache_prefix: var("S3FILESTORE_CACHE_PREFIX")
                .unwrap_or_else(|| crate::services::cache::DEFAULT_CACHE_PREFIX.into()),
            queue: QueueSettings {
                name: var("S3FILESTORE_QUEUE").unwrap_or_else(|| "default".into()),
                job_ttl: parse_secs(&var, "S3FILESTORE_JOB_TTL", DEFAULT_JOB_TTL_SECS)?,
                failure_ttl: parse_secs(&var, "S3FILESTORE_JOB_FAILURE_TTL", DEFAULT_JOB_TTL_SECS)?,
            },
            catalog,
            capabilities: HostCapabilities {
                filesystem_fallback: parse_bool(&var, "S3FILESTORE_FILESYSTEM_FALLBACK", false)?,
                async_visibility_update: parse_bool(&var, "S3FILESTORE_ASYNC_UPDATE", true)?,
            },
        })
    }
}

/// Bare `host:port` endpoints get an `https://` scheme.
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn parse_policy(raw: Option<String>, default: AclState) -> Result<AclPolicy> {
    match raw {
        Some(value) => value.parse().map_err(|e: String| anyhow!(e)),
        None => Ok(AclPolicy::Fixed(default)),
    }
}

fn parse_secs<F>(var: &F, name: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(Duration::from_secs(default)),
    }
}

fn parse_millis<F>(var: &F, name: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = match var(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("parsing {} value `{}`", name, value))?,
        None => default,
    };
    if millis == 0 {
        bail!("{name} must be greater than zero");
    }
    Ok(Duration::from_millis(millis))
}

fn parse_bool<F>(var: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => bail!("parsing {} value `{}`: expected a boolean", name, value),
        },
        None => Ok(default),
    }
}

/// Validate bucket name format.
///
/// S3 naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> Result<(), String> {
    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err("must be between 3 and 63 characters".into());
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err("allowed characters are lowercase letters, digits, dots, and hyphens".into());
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err("must start and end with a lowercase letter or digit".into());
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err("cannot contain consecutive dots or dot-hyphen combinations".into());
    }
    if is_ipv4_like(name) {
        return Err("must not be formatted like an IP address".into());
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("S3FILESTORE_BUCKET", "ckan-data"),
            ("S3FILESTORE_REGION", "eu-west-1"),
            ("S3FILESTORE_SIGNATURE_VERSION", "s3v4"),
            ("S3FILESTORE_ACCESS_KEY_ID", "AKIA"),
            ("S3FILESTORE_SECRET_ACCESS_KEY", "secret"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<FilestoreConfig> {
        FilestoreConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()), &ConfigArgs::default())
    }

    #[test]
    fn defaults() {
        let cfg = load(&base()).unwrap();
        assert_eq!(cfg.acl, AclPolicy::Fixed(AclState::Public));
        assert_eq!(cfg.non_current_acl, AclPolicy::Fixed(AclState::Private));
        assert_eq!(cfg.signed_url_expiry, Duration::from_secs(3600));
        assert_eq!(cfg.cache_window, Duration::from_secs(1800));
        assert_eq!(cfg.inline_content_types, vec!["application/pdf".to_string()]);
        assert!(cfg.store.path_style);
        assert!(cfg.check_access_on_startup);
        assert!(cfg.capabilities.async_visibility_update);
        assert!(!cfg.capabilities.filesystem_fallback);
        assert!(matches!(cfg.store.credentials, CredentialMode::Static { .. }));
    }

    #[test]
    fn ambient_role_needs_no_keys() {
        let mut vars = base();
        vars.remove("S3FILESTORE_ACCESS_KEY_ID");
        vars.remove("S3FILESTORE_SECRET_ACCESS_KEY");
        assert!(load(&vars).is_err());
        vars.insert("S3FILESTORE_USE_AMBIENT_ROLE", "true");
        assert!(matches!(load(&vars).unwrap().store.credentials, CredentialMode::Ambient));
    }

    #[test]
    fn proxy_switches_auto_addressing_to_virtual() {
        let mut vars = base();
        vars.insert("S3FILESTORE_DOWNLOAD_PROXY", "https://downloads.example/");
        let cfg = load(&vars).unwrap();
        assert!(!cfg.store.path_style);
        assert_eq!(cfg.download_proxy.as_deref(), Some("https://downloads.example"));

        vars.insert("S3FILESTORE_ADDRESSING_STYLE", "path");
        assert!(load(&vars).unwrap().store.path_style);
    }

    #[test]
    fn rejects_bad_values() {
        let mut vars = base();
        vars.insert("S3FILESTORE_SIGNATURE_VERSION", "s3");
        assert!(load(&vars).is_err());

        let mut vars = base();
        vars.insert("S3FILESTORE_ACL", "authenticated-read");
        assert!(load(&vars).is_err());

        let mut vars = base();
        vars.insert("S3FILESTORE_SIGNED_URL_EXPIRY", "ten");
        assert!(load(&vars).is_err());

        for expiry in ["0", "1", "604801"] {
            let mut vars = base();
            vars.insert("S3FILESTORE_SIGNED_URL_EXPIRY", expiry);
            assert!(load(&vars).is_err(), "expiry {expiry} should be rejected");
        }
        let mut vars = base();
        vars.insert("S3FILESTORE_SIGNED_URL_EXPIRY", "2");
        assert_eq!(load(&vars).unwrap().signed_url_expiry, Duration::from_secs(2));

        let mut vars = base();
        vars.insert("S3FILESTORE_BUCKET", "192.168.1.1");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn cli_overrides_environment() {
        let args = ConfigArgs {
            bucket: Some("other-bucket".into()),
            acl: Some("auto".into()),
            ..ConfigArgs::default()
        };
        let vars = base();
        let cfg = FilestoreConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()), &args).unwrap();
        assert_eq!(cfg.store.bucket, "other-bucket");
        assert_eq!(cfg.acl, AclPolicy::Auto);
    }

    #[test]
    fn bare_endpoints_get_a_scheme() {
        let mut vars = base();
        vars.insert("S3FILESTORE_HOST_NAME", "minio:9000");
        assert_eq!(load(&vars).unwrap().store.endpoint.as_deref(), Some("https://minio:9000"));
        vars.insert("S3FILESTORE_HOST_NAME", "http://minio:9000/");
        assert_eq!(load(&vars).unwrap().store.endpoint.as_deref(), Some("http://minio:9000"));
    }

    #[test]
    fn bucket_names() {
        assert!(validate_bucket_name("my.bucket-1").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Upper").is_err());
        assert!(validate_bucket_name("-lead").is_err());
        assert!(validate_bucket_name("a..b").is_err());
        assert!(validate_bucket_name("10.0.0.1").is_err());
    }
}
