use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::controller::error::{ConfigError, Error};

pub const DEFAULT_HTTP_PORT: u32 = 8080;
pub const DEFAULT_REQUEUE_INTERVAL: u64 = 30 * 60;

// Default name and namespace of the load balancer ConfigMap.
pub const DEFAULT_CONFIG_MAP_NAME: &str = "kubevip";
pub const DEFAULT_CONFIG_MAP_NAMESPACE: &str = "kube-system";

// LoadBalancerClass handled by this controller unless overridden.
pub const DEFAULT_LOAD_BALANCER_CLASS: &str = "kube-vip.io/kube-vip-class";

pub const ENV_NAMESPACE: &str = "KUBEVIP_NAMESPACE";
pub const ENV_CONFIG_MAP: &str = "KUBEVIP_CONFIG_MAP";
pub const ENV_ENABLE_LOAD_BALANCER_CLASS: &str = "KUBEVIP_ENABLE_LOADBALANCERCLASS";
pub const ENV_CUSTOM_LOAD_BALANCER_CLASS_NAME: &str = "KUBEVIP_CUSTOM_LOADBALANCERCLASS_NAME";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub http_port: u32,
    pub namespace: String,
    pub config_map: String,
    pub enable_load_balancer_class: bool,
    pub load_balancer_class: String,
    pub requeue_interval: u64,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        serde_yaml::from_str(&contents).map_err(|_| Error::Config(ConfigError::FailedToLoad))
    }

    /// Build the configuration from the process environment, falling
    /// back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Config::default();
        if let Ok(ns) = env::var(ENV_NAMESPACE) {
            if !ns.is_empty() {
                config.namespace = ns;
            }
        }
        if let Ok(cm) = env::var(ENV_CONFIG_MAP) {
            if !cm.is_empty() {
                config.config_map = cm;
            }
        }
        if let Ok(enable) = env::var(ENV_ENABLE_LOAD_BALANCER_CLASS) {
            if !enable.is_empty() {
                config.enable_load_balancer_class = enable
                    .parse()
                    .map_err(|_| Error::Config(ConfigError::InvalidArgument))?;
            }
        }
        if let Ok(class) = env::var(ENV_CUSTOM_LOAD_BALANCER_CLASS_NAME) {
            if !class.is_empty() {
                config.load_balancer_class = class;
            }
        }
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            namespace: DEFAULT_CONFIG_MAP_NAMESPACE.to_string(),
            config_map: DEFAULT_CONFIG_MAP_NAME.to_string(),
            enable_load_balancer_class: false,
            load_balancer_class: DEFAULT_LOAD_BALANCER_CLASS.to_string(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }
}
