// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hover-runtime.

use std::path::PathBuf;
use std::str::FromStr;

use crate::manifest::ManifestError;
use crate::sigv4::Credentials;

/// Which kind of work this function instance serves.
///
/// Derived from the deployed function name (`{app}-http`, `{app}-cli`,
/// `{app}-{queue}-queue`) unless `HOVER_ROLE` overrides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionRole {
    /// HTTP requests bridged to the worker process.
    Http,
    /// Console commands.
    Cli,
    /// Queue batches.
    Queue,
}

impl FunctionRole {
    /// Role implied by a function name suffix.
    pub fn from_function_name(name: &str) -> Option<Self> {
        if name.ends_with("-http") {
            Some(FunctionRole::Http)
        } else if name.ends_with("-cli") {
            Some(FunctionRole::Cli)
        } else if name.ends_with("-queue") {
            Some(FunctionRole::Queue)
        } else {
            None
        }
    }

    /// Lower-case name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionRole::Http => "http",
            FunctionRole::Cli => "cli",
            FunctionRole::Queue => "queue",
        }
    }
}

impl FromStr for FunctionRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(FunctionRole::Http),
            "cli" => Ok(FunctionRole::Cli),
            "queue" => Ok(FunctionRole::Queue),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host and port of the control-plane API (`AWS_LAMBDA_RUNTIME_API`)
    pub runtime_api: String,
    /// Deployed function name
    pub function_name: String,
    /// Deployed function version, used as the qualifier for self-invocation
    pub function_version: String,
    /// Region the function runs in
    pub region: String,
    /// Root of the deployed application
    pub task_root: PathBuf,
    /// Location of the application manifest
    pub manifest_path: PathBuf,
    /// Explicit application name
    pub app_name: Option<String>,
    /// Role override; `None` means derive from the function name
    pub role: Option<FunctionRole>,
    /// Directory holding the worker socket, pid and config files
    pub runtime_dir: PathBuf,
    /// Worker executable
    pub worker_binary: String,
    /// Template copied into place as the worker config on first start
    pub worker_config_template: PathBuf,
    /// Front controller script passed as `SCRIPT_FILENAME`
    pub script_filename: PathBuf,
    /// Shell prefix for console commands
    pub cli_entrypoint: String,
    /// Shell command that runs one queue job read from stdin
    pub queue_command: String,
    /// Base URL of the function invoke API
    pub lambda_endpoint: String,
    /// Credentials for self-invocation, when present
    pub credentials: Option<Credentials>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let runtime_api =
            var("AWS_LAMBDA_RUNTIME_API").ok_or(ConfigError::MissingEnvVar("AWS_LAMBDA_RUNTIME_API"))?;

        let function_name =
            var("AWS_LAMBDA_FUNCTION_NAME").unwrap_or_else(|| "hover-http".to_string());
        let function_version =
            var("AWS_LAMBDA_FUNCTION_VERSION").unwrap_or_else(|| "$LATEST".to_string());
        let region = var("AWS_REGION")
            .or_else(|| var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| "us-east-1".to_string());

        let task_root = PathBuf::from(var("LAMBDA_TASK_ROOT").unwrap_or_else(|| "/var/task".to_string()));
        let runtime_files = task_root.join("hover_runtime");

        let manifest_path = var("HOVER_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or_else(|| runtime_files.join("manifest.json"));

        let role = var("HOVER_ROLE").map(|r| r.parse()).transpose()?;

        let runtime_dir =
            PathBuf::from(var("HOVER_RUNTIME_DIR").unwrap_or_else(|| "/tmp/.hover".to_string()));

        let worker_config_template = var("HOVER_WORKER_CONFIG_TEMPLATE")
            .map(PathBuf::from)
            .unwrap_or_else(|| runtime_files.join("php-fpm.conf"));
        let script_filename = var("HOVER_SCRIPT_FILENAME")
            .map(PathBuf::from)
            .unwrap_or_else(|| runtime_files.join("index.php"));

        let artisan = task_root.join("artisan");
        let cli_entrypoint = var("HOVER_CLI_ENTRYPOINT")
            .unwrap_or_else(|| format!("php {}", artisan.display()));
        let queue_command = var("HOVER_QUEUE_COMMAND")
            .unwrap_or_else(|| format!("php {} hover:queue-job", artisan.display()));

        let lambda_endpoint = var("AWS_ENDPOINT_URL_LAMBDA")
            .unwrap_or_else(|| format!("https://lambda.{}.amazonaws.com", region));
        let lambda_endpoint = lambda_endpoint.trim_end_matches('/').to_string();

        let credentials = match (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            }),
            _ => None,
        };

        Ok(Self {
            runtime_api,
            function_name,
            function_version,
            region,
            task_root,
            manifest_path,
            app_name: var("HOVER_APP_NAME"),
            role,
            runtime_dir,
            worker_binary: var("HOVER_WORKER_BINARY").unwrap_or_else(|| "php-fpm".to_string()),
            worker_config_template,
            script_filename,
            cli_entrypoint,
            queue_command,
            lambda_endpoint,
            credentials,
        })
    }

    /// The role this instance serves, or `None` when every processor is
    /// enabled.
    pub fn effective_role(&self) -> Option<FunctionRole> {
        self.role
            .or_else(|| FunctionRole::from_function_name(&self.function_name))
    }

    /// Application name, in order of preference: explicit setting, the
    /// manifest's name, then the function name without its role suffix.
    pub fn resolve_app_name(&self, manifest_name: Option<&str>) -> String {
        if let Some(name) = &self.app_name {
            return name.clone();
        }
        if let Some(name) = manifest_name {
            return name.to_string();
        }
        let name = self.function_name.as_str();
        for suffix in ["-http", "-cli"] {
            if let Some(prefix) = name.strip_suffix(suffix) {
                return prefix.to_string();
            }
        }
        // `{app}-{queue}-queue`: without a manifest only the first segment is
        // unambiguous.
        name.split('-').next().unwrap_or(name).to_string()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// `HOVER_ROLE` is not one of `http`, `cli`, `queue`.
    #[error("Invalid function role: {0}")]
    InvalidRole(String),
    /// The application manifest could not be read.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}
