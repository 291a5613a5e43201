//! Signing step for finished bundles. Never retried: a failure aborts the
//! install that asked for it.

use std::path::Path;

use crate::error::{TileError, TileResult};
use crate::tool_cmd::tool_cmd;

pub trait BundleSigner: Send + Sync {
    fn sign(&self, bundle: &Path) -> TileResult<()>;
}

/// `codesign --force --deep --sign <identity> <bundle>`; identity `-` is ad hoc.
pub struct CodesignSigner {
    identity: String,
}

impl CodesignSigner {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

impl BundleSigner for CodesignSigner {
    fn sign(&self, bundle: &Path) -> TileResult<()> {
        tool_cmd("codesign")
            .args(&["--force", "--deep", "--sign", &self.identity])
            .arg_path(bundle)
            .run()
            .map(drop)
            .map_err(|e| TileError::SigningFailed {
                path: bundle.to_path_buf(),
                reason: e.to_string(),
            })
    }
}
