//! Resource generation contract
//!
//! The engine never builds resources itself. It looks up the generator
//! registered for a type and asks it for the resources a proxy should see.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::context::PushContext;
use crate::error::{Result, XdsError};
use crate::model::{Proxy, PushRequest};
use crate::watch::WatchedResource;
use crate::xds::ResourceType;
use crate::xds::proto::Any;

/// One generated resource, already serialized
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceData {
    pub name: String,
    pub resource_type: ResourceType,
    pub data: Vec<u8>,
}

impl ResourceData {
    pub fn json<T: Serialize>(
        resource_type: ResourceType,
        name: impl Into<String>,
        body: &T,
    ) -> Result<Self> {
        let name = name.into();
        let data = serde_json::to_vec(body).map_err(|e| {
            XdsError::generation(resource_type.to_string(), name.clone(), e.to_string())
        })?;
        Ok(Self {
            name,
            resource_type,
            data,
        })
    }

    pub fn into_any(self) -> Any {
        Any {
            type_url: self.resource_type.type_url().to_string(),
            value: self.data,
        }
    }
}

pub trait Generator: Send + Sync {
    /// Resources of one type for `proxy`. `Ok(None)` means there is nothing
    /// to send for this push.
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> Result<Option<Vec<ResourceData>>>;
}

#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<ResourceType, Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource_type: ResourceType, generator: Arc<dyn Generator>) {
        self.generators.insert(resource_type, generator);
    }

    pub fn with(mut self, resource_type: ResourceType, generator: Arc<dyn Generator>) -> Self {
        self.register(resource_type, generator);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<&Arc<dyn Generator>> {
        self.generators.get(&resource_type)
    }

    pub fn contains(&self, resource_type: ResourceType) -> bool {
        self.generators.contains_key(&resource_type)
    }

    pub fn generate(
        &self,
        resource_type: ResourceType,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> Result<Option<Vec<ResourceData>>> {
        let generator = self.get(resource_type).ok_or_else(|| {
            XdsError::generation(
                resource_type.to_string(),
                proxy.id.clone(),
                "no generator registered",
            )
        })?;
        generator.generate(proxy, push, watched, request)
    }
}
