use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Structured text generation (planning).
    Text,
    /// Image in, text out (verification).
    Vision,
    /// Image generation.
    Image,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Vision => "vision",
            Self::Image => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
}

impl ModelSpec {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    use Capability::{Image, Text, Vision};

    let mut map = IndexMap::new();
    let mut insert = |name: &str, provider: &str, capabilities: &[Capability]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities.to_vec(),
            },
        );
    };

    insert("gemini-2.5-flash", "gemini", &[Text, Vision]);
    insert("gemini-2.5-pro", "gemini", &[Text, Vision]);
    insert("gemini-3-pro-preview", "gemini", &[Text, Vision]);
    insert("gemini-2.5-flash-image", "gemini", &[Image]);
    insert("gemini-3-pro-image-preview", "gemini", &[Image]);
    insert("gpt-4o-mini", "openai", &[Text, Vision]);
    insert("gpt-5.2", "openai", &[Text, Vision]);
    insert("dryrun-image-1", "dryrun", &[Image]);

    map
}
