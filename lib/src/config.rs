use crate::model::{Model, TagMask};

/// Knobs for one parse
///
/// These select which optional tables and instrumentation end up in the bytecode. They never
/// change which calls the parser is allowed to make: source sections, tags, and instrumentations
/// are always accepted, they just become transparent when disabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Record source sections into the source info table
    ///
    /// Only has an effect if the model enables [`crate::model::Features::SOURCE_INFO`].
    pub source_info: bool,

    /// Tags that get `tag.enter`/`tag.leave` instructions and exceptional handler entries
    ///
    /// A `Tag` operation is emitted if any of its tags are in this set.
    pub instrumented_tags: TagMask,

    /// Bitmask of enabled instrumentation operations
    ///
    /// Bit `i` enables the `i`-th instrumentation operation, in the order the model declares
    /// them. Disabled instrumentations emit nothing and pass their operand through.
    pub instrumentations: u32,

    /// Maximum number of idle builder states kept by a pool created for this config
    pub pool_capacity: usize,
}

impl BuilderConfig {
    /// Plain bytecode: no source info, tags, or instrumentation
    pub fn minimal() -> BuilderConfig {
        BuilderConfig {
            source_info: false,
            instrumented_tags: TagMask::NONE,
            instrumentations: 0,
            pool_capacity: crate::StatePool::DEFAULT_CAPACITY,
        }
    }

    /// Instrument only the named tags
    pub fn with_tags(mut self, model: &Model, tags: &[&str]) -> Result<BuilderConfig, crate::Error> {
        self.instrumented_tags = model.tag_mask(tags)?;
        Ok(self)
    }

    /// Pool sized for this config
    pub fn pool(&self) -> crate::StatePool {
        crate::StatePool::new(self.pool_capacity)
    }
}

impl Default for BuilderConfig {
    fn default() -> BuilderConfig {
        BuilderConfig {
            source_info: true,
            instrumented_tags: TagMask::ALL,
            instrumentations: u32::MAX,
            pool_capacity: crate::StatePool::DEFAULT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Features, ModelBuilder};

    #[test]
    fn named_tags() {
        let model = ModelBuilder::new("Tags")
            .features(Features::TAGS)
            .tag("Statement")
            .tag("Expression")
            .build()
            .unwrap();
        let config = BuilderConfig::minimal()
            .with_tags(&model, &["Expression"])
            .unwrap();
        assert_eq!(config.instrumented_tags, TagMask(0b10));
        assert!(BuilderConfig::minimal()
            .with_tags(&model, &["Declaration"])
            .is_err());
        assert_eq!(config.pool().capacity(), crate::StatePool::DEFAULT_CAPACITY);
    }
}
