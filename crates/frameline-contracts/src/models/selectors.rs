use super::registry::{Capability, ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Honours `requested` when the registry knows it for `capability`;
    /// otherwise picks the first registered model for the capability and
    /// records why. Blank names count as unspecified.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: Capability,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());
        if let Some(model) = requested.and_then(|name| self.registry.ensure(name, capability)) {
            return Ok(ModelSelection {
                model,
                requested: requested.map(str::to_string),
                fallback_reason: None,
            });
        }

        let capability_name = capability.as_str();
        let fallback_reason = match requested {
            Some(name) => format!(
                "Requested model '{name}' unavailable for capability '{capability_name}'."
            ),
            None => "No model specified; using default.".to_string(),
        };
        self.registry
            .by_capability(capability)
            .into_iter()
            .next()
            .map(|model| ModelSelection {
                model,
                requested: requested.map(str::to_string),
                fallback_reason: Some(fallback_reason),
            })
            .ok_or_else(|| format!("No models available for capability '{capability_name}'."))
    }
}
