use super::toml::FunctionConfigToml;
use anyhow::{Context as _, bail, ensure};
use concepts::{Batching, Context, FunctionId, FunctionSpec};
use hashbrown::HashSet;
use indexmap::IndexMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Function definitions declared by the `[[function]]` entries of the configuration.
#[derive(Debug, Default)]
pub(crate) struct FunctionStore {
    functions: Vec<FunctionSpec>,
}

impl FunctionStore {
    /// Resolves relative directories against `base_dir` and environment variables against the host.
    pub(crate) fn load(
        functions: Vec<FunctionConfigToml>,
        base_dir: &Path,
    ) -> Result<Self, anyhow::Error> {
        let mut ids = HashSet::new();
        let mut cwds = HashSet::new();
        let functions = functions
            .into_iter()
            .map(|function| {
                let id = function.id.clone();
                ensure!(!id.is_empty(), "function `id` must not be empty");
                ensure!(ids.insert(id.clone()), "function `{id}` is declared more than once");
                let spec = resolve(function, base_dir)
                    .with_context(|| format!("cannot resolve function `{id}`"))?;
                ensure!(
                    cwds.insert(spec.cwd.clone()),
                    "directory {:?} of function `{id}` is shared with another function",
                    spec.cwd
                );
                debug!(
                    function_id = %spec.id,
                    cwd = ?spec.cwd,
                    "Loaded function with {} triggers",
                    spec.triggers.len()
                );
                Ok(spec)
            })
            .collect::<Result<_, anyhow::Error>>()?;
        Ok(Self { functions })
    }

    pub(crate) fn functions(&self) -> &[FunctionSpec] {
        &self.functions
    }

    pub(crate) fn into_functions(self) -> Vec<FunctionSpec> {
        self.functions
    }
}

fn resolve(function: FunctionConfigToml, base_dir: &Path) -> Result<FunctionSpec, anyhow::Error> {
    let cwd = if function.cwd.is_absolute() {
        function.cwd
    } else {
        base_dir.join(function.cwd)
    };
    let env = function
        .env_vars
        .iter()
        .map(super::env_var::EnvVarConfig::resolve)
        .collect::<Result<IndexMap<_, _>, _>>()?;
    let batch = match function.batch {
        Some(batch) => {
            if batch.limit == 0 {
                bail!("`batch.limit` must be at least 1");
            }
            Some(Batching {
                limit: batch.limit,
                deadline: Duration::from(batch.deadline),
            })
        }
        None => None,
    };
    let mut context = Context {
        env,
        batch,
        ..Context::default()
    };
    if let Some(timeout) = function.timeout {
        context.timeout = timeout.into();
    }
    Ok(FunctionSpec {
        id: FunctionId::new(function.id),
        cwd,
        context: Arc::new(context),
        triggers: function.triggers,
    })
}
