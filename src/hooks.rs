//! Per-namespace hook configuration.
//!
//! Namespace owners describe their maintenance hooks in a ConfigMap named
//! `patchmanagement`: a pre script, a post script, an optional image override
//! and a `;`-joined list of secret names injected into the hook job's
//! environment. Absence of the ConfigMap simply means the namespace has no
//! hooks.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::cluster::ClusterOps;
use crate::error::Result;
use crate::job::HookPhase;

/// Well-known name of the per-namespace hook ConfigMap.
pub const HOOK_CONFIG_MAP: &str = "patchmanagement";

pub const DEFAULT_HOOK_IMAGE: &str = "redhat/ubi8-minimal:latest";

const PRE_SCRIPT_KEY: &str = "pre-job";
const POST_SCRIPT_KEY: &str = "post-job";
const IMAGE_KEY: &str = "image";
const SECRETS_KEY: &str = "secrets";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub pre_script: String,
    pub post_script: String,
    pub image: String,
    pub secret_names: Vec<String>,
}

impl Default for HookSpec {
    fn default() -> Self {
        Self {
            pre_script: String::new(),
            post_script: String::new(),
            image: DEFAULT_HOOK_IMAGE.to_string(),
            secret_names: Vec::new(),
        }
    }
}

impl HookSpec {
    pub fn script_for(&self, phase: HookPhase) -> &str {
        match phase {
            HookPhase::Pre => &self.pre_script,
            HookPhase::Post => &self.post_script,
        }
    }

    fn from_data(data: &BTreeMap<String, String>) -> Self {
        let image = data
            .get(IMAGE_KEY)
            .filter(|image| !image.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_HOOK_IMAGE.to_string());
        let secret_names = data
            .get(SECRETS_KEY)
            .map(|joined| {
                joined
                    .split(';')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            pre_script: data.get(PRE_SCRIPT_KEY).cloned().unwrap_or_default(),
            post_script: data.get(POST_SCRIPT_KEY).cloned().unwrap_or_default(),
            image,
            secret_names,
        }
    }
}

pub struct HookResolver<C> {
    cluster: Arc<C>,
}

impl<C: ClusterOps> HookResolver<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    /// Read the namespace's hook configuration.
    ///
    /// Read fresh on every call; the workflow must observe edits made between
    /// the pre and post phase. A missing ConfigMap yields an empty spec, any
    /// other retrieval error propagates unchanged.
    pub async fn resolve(&self, namespace: &str) -> Result<HookSpec> {
        match self.cluster.get_config_map(namespace, HOOK_CONFIG_MAP).await? {
            None => {
                debug!(namespace, "no hook configuration found");
                Ok(HookSpec::default())
            }
            Some(config_map) => Ok(HookSpec::from_data(&config_map.data.unwrap_or_default())),
        }
    }
}
