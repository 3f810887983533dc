//! Shared object graph types and the type-signature resolver seam.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{FrameError, Result};
use crate::value::{ValueReader, ValueWriter};

/// A composite value that travels by identity inside one value stream.
///
/// Implementations are normally generated from the application schema: they
/// write their fields in declaration order and read them back in the same
/// order. A field that refers to another object goes through
/// [`ValueWriter::write_object`] / [`ValueReader::read_object`] so that
/// shared and cyclic references keep their shape.
pub trait RemoteObject: AsAny + Send + fmt::Debug {
    /// Write every field, in order.
    fn write_fields(&self, writer: &mut ValueWriter) -> Result<()>;

    /// Populate a blank instance from the stream, in the same order.
    fn read_fields(&mut self, reader: &mut ValueReader) -> Result<()>;
}

/// Dynamic type access for [`RemoteObject`] implementors.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A shared, interior-mutable handle to an object in a graph.
///
/// Identity is the allocation: two handles alias iff [`Arc::ptr_eq`].
pub type ObjectRef = Arc<Mutex<dyn RemoteObject>>;

/// Wrap a value as a graph node.
pub fn new_object<T: RemoteObject>(value: T) -> ObjectRef {
    Arc::new(Mutex::new(value))
}

/// Lock a node, recovering the guard if a previous holder panicked.
pub fn lock_object(object: &ObjectRef) -> MutexGuard<'_, dyn RemoteObject> {
    object.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` against the concrete type behind `object`, if it is a `T`.
pub fn with_object<T: RemoteObject, R>(object: &ObjectRef, f: impl FnOnce(&T) -> R) -> Option<R> {
    let guard = lock_object(object);
    AsAny::as_any(&*guard).downcast_ref::<T>().map(f)
}

/// Mutable counterpart of [`with_object`].
pub fn with_object_mut<T: RemoteObject, R>(
    object: &ObjectRef,
    f: impl FnOnce(&mut T) -> R,
) -> Option<R> {
    let mut guard = lock_object(object);
    AsAny::as_any_mut(&mut *guard).downcast_mut::<T>().map(f)
}

/// Maps objects to signature tokens and tokens back to blank instances.
pub trait TypeResolver: Send + Sync {
    /// The signature token naming `object`'s type on the wire.
    fn signature_of(&self, object: &dyn RemoteObject) -> Result<Arc<str>>;

    /// A blank instance for `signature`, ready for `read_fields`.
    fn instantiate(&self, signature: &str) -> Result<ObjectRef>;
}

type Constructor = fn() -> ObjectRef;

fn construct<T: RemoteObject + Default>() -> ObjectRef {
    new_object(T::default())
}

/// A [`TypeResolver`] backed by explicit registrations.
#[derive(Default)]
pub struct TypeRegistry {
    signatures: HashMap<TypeId, Arc<str>>,
    constructors: HashMap<Arc<str>, Constructor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `signature`. Re-registering replaces the mapping.
    pub fn register<T: RemoteObject + Default>(&mut self, signature: &str) -> &mut Self {
        let signature: Arc<str> = Arc::from(signature);
        self.signatures
            .insert(TypeId::of::<T>(), Arc::clone(&signature));
        self.constructors.insert(signature, construct::<T>);
        self
    }

    /// Builder-style [`TypeRegistry::register`].
    pub fn with<T: RemoteObject + Default>(mut self, signature: &str) -> Self {
        self.register::<T>(signature);
        self
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl TypeResolver for TypeRegistry {
    fn signature_of(&self, object: &dyn RemoteObject) -> Result<Arc<str>> {
        let type_id = AsAny::as_any(object).type_id();
        self.signatures
            .get(&type_id)
            .cloned()
            .ok_or_else(|| FrameError::UnregisteredType(AsAny::type_name(object)))
    }

    fn instantiate(&self, signature: &str) -> Result<ObjectRef> {
        self.constructors
            .get(signature)
            .map(|ctor| ctor())
            .ok_or_else(|| FrameError::UnknownSignature(signature.to_string()))
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.constructors.keys().map(|s| s.as_ref()).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("signatures", &names)
            .finish()
    }
}
