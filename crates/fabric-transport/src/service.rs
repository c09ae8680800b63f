//! Service descriptors: a fixed mapping from method identity to call shape
//!
//! Descriptors are built once, when a service is declared, and are immutable
//! afterwards. Every proxied call carries its [`MethodId`] as the first
//! eight bytes of the application metadata so the receiving side can resolve
//! the handler without any per-call reflection.

use fabric_core::{hash_name, FabricError, FabricResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// The four interaction models a method can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallShape {
    /// One request, no reply
    FireAndForget,
    /// One request, one reply
    RequestResponse,
    /// One request, a stream of replies
    RequestStream,
    /// Streams in both directions
    RequestChannel,
}

/// Hashed `service.method` identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u64);

impl MethodId {
    /// Bytes the id occupies at the front of the metadata
    pub const ENCODED_LEN: usize = 8;

    /// Identity of `method` on `service`
    pub fn of(service: &str, method: &str) -> Self {
        Self(hash_name(&format!("{service}.{method}")) as u64)
    }

    /// `metadata` with this id in front
    pub fn prefix(&self, metadata: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN + metadata.len());
        out.extend_from_slice(&self.0.to_be_bytes());
        out.extend_from_slice(metadata);
        out
    }

    /// Split the method id off the front of `metadata`
    pub fn split(metadata: &[u8]) -> FabricResult<(Self, &[u8])> {
        if metadata.len() < Self::ENCODED_LEN {
            return Err(FabricError::malformed_frame(format!(
                "metadata too short for a method id: {} bytes",
                metadata.len()
            )));
        }
        let (id, rest) = metadata.split_at(Self::ENCODED_LEN);
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes.copy_from_slice(id);
        Ok((Self(u64::from_be_bytes(bytes)), rest))
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method-{:016x}", self.0)
    }
}

/// One method of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Service the method belongs to
    pub service: String,
    /// Method name
    pub name: String,
    /// Hashed identity
    pub id: MethodId,
    /// How the method is called
    pub shape: CallShape,
}

/// Immutable method table of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: BTreeMap<MethodId, MethodDescriptor>,
    by_name: HashMap<String, MethodId>,
}

impl ServiceDescriptor {
    /// Start declaring `service`
    pub fn builder(service: impl Into<String>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder {
            name: service.into(),
            methods: Vec::new(),
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Method by name
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.by_name.get(name).and_then(|id| self.methods.get(id))
    }

    /// Method by id
    pub fn method_by_id(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.methods.get(&id)
    }

    /// All methods, ordered by id
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    /// Number of methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True if the service declares no methods
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Builder for [`ServiceDescriptor`]
#[derive(Debug, Clone)]
pub struct ServiceDescriptorBuilder {
    name: String,
    methods: Vec<(String, CallShape)>,
}

impl ServiceDescriptorBuilder {
    /// Declare `method` with `shape`
    pub fn method(mut self, method: impl Into<String>, shape: CallShape) -> Self {
        self.methods.push((method.into(), shape));
        self
    }

    /// Freeze the method table
    pub fn build(self) -> FabricResult<ServiceDescriptor> {
        if self.name.is_empty() {
            return Err(FabricError::invalid_argument("service name is empty"));
        }

        let mut methods = BTreeMap::new();
        let mut by_name = HashMap::new();
        for (name, shape) in self.methods {
            if name.is_empty() {
                return Err(FabricError::invalid_argument(format!(
                    "service {} declares a method with an empty name",
                    self.name
                )));
            }
            let id = MethodId::of(&self.name, &name);
            if by_name.contains_key(&name) {
                return Err(FabricError::invalid_argument(format!(
                    "method {}.{name} declared twice",
                    self.name
                )));
            }
            if methods.contains_key(&id) {
                return Err(FabricError::invalid_argument(format!(
                    "method {}.{name} collides with another method id",
                    self.name
                )));
            }

            by_name.insert(name.clone(), id);
            methods.insert(
                id,
                MethodDescriptor {
                    service: self.name.clone(),
                    name,
                    id,
                    shape,
                },
            );
        }

        Ok(ServiceDescriptor {
            name: self.name,
            methods,
            by_name,
        })
    }
}
