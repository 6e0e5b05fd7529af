//! Managed type resolution and the method table cache.
//!
//! Every object on the managed heap starts with a pointer to its method table. Resolving
//! that pointer to a [`ClrType`] is the hottest operation of any heap walk, so resolved
//! types are kept in a [`TypeCache`] keyed by `(method_table, component_method_table)`.
//! The component part distinguishes arrays of different reference types, which share one
//! runtime method table and store their element type in each instance.
//!
//! # Key Components
//!
//! - [`ClrType`] - A resolved type with sizing information and a lazily decoded GCDesc
//! - [`TypeCache`] - Concurrent `(mt, cmt) -> ClrType` map guaranteeing one instance per key
//! - [`ElementKind`] / [`TypeFlags`] - Type category and attribute bits
//!
//! # Thread Safety
//!
//! The cache is backed by [`dashmap::DashMap`]; concurrent resolution of the same key may
//! build the type twice but only the first insertion is ever returned.

use std::sync::{Arc, RwLock};

use bitflags::bitflags;
use dashmap::DashMap;
use strum::{Display, EnumIter};

use crate::{
    heap::gcdesc::GcDesc,
    metadata::token::Token,
    runtime::RuntimeProvider,
    target::{reader::MemoryReader, PointerSize},
};

/// A reference-counted pointer to a [`ClrType`].
pub type ClrTypeRc = Arc<ClrType>;

/// Broad category of a managed type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ElementKind {
    /// Filler object covering unused heap space
    Free,
    /// Reference type
    Object,
    /// `System.String`
    String,
    /// Array of any element type
    Array,
    /// Boxed value type
    ValueType,
    /// Boxed primitive
    Primitive,
}

bitflags! {
    /// Attribute bits of a resolved type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u32 {
        /// Instances contain object references
        const CONTAINS_POINTERS = 0x0001;
        /// Instances have a trailing variable-length component
        const VARIABLE_SIZE = 0x0002;
        /// Free filler type
        const FREE = 0x0004;
        /// Array type
        const ARRAY = 0x0008;
        /// `System.String`
        const STRING = 0x0010;
        /// Element type is stored per instance
        const SHARED_ARRAY = 0x0020;
    }
}

/// Lazily computed GC descriptor.
#[derive(Debug, Clone)]
pub enum GcDescState {
    /// Not decoded yet
    NotComputed,
    /// Decoded; `None` if the type has no readable descriptor
    Computed(Option<Arc<GcDesc>>),
}

/// A resolved managed type.
#[derive(Debug)]
pub struct ClrType {
    method_table: u64,
    component_method_table: u64,
    kind: ElementKind,
    flags: TypeFlags,
    base_size: u32,
    component_size: u32,
    token: Token,
    module: u64,
    parent: u64,
    name: Option<String>,
    component_type: Option<ClrTypeRc>,
    pointer_size: PointerSize,
    gc_desc: RwLock<GcDescState>,
}

impl ClrType {
    /// Method table of the type.
    #[must_use]
    pub fn method_table(&self) -> u64 {
        self.method_table
    }

    /// Element method table for shared reference arrays, zero otherwise.
    #[must_use]
    pub fn component_method_table(&self) -> u64 {
        self.component_method_table
    }

    /// Type category.
    #[must_use]
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Attribute bits.
    #[must_use]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    /// Instance size including the object header.
    #[must_use]
    pub fn base_size(&self) -> u32 {
        self.base_size
    }

    /// Per-element size, zero for fixed-size types.
    #[must_use]
    pub fn component_size(&self) -> u32 {
        self.component_size
    }

    /// Metadata token of the type definition.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Owning module, zero for the free type.
    #[must_use]
    pub fn module(&self) -> u64 {
        self.module
    }

    /// Parent method table.
    #[must_use]
    pub fn parent(&self) -> u64 {
        self.parent
    }

    /// Type name, if the runtime reported one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Element type of a shared reference array.
    #[must_use]
    pub fn component_type(&self) -> Option<&ClrTypeRc> {
        self.component_type.as_ref()
    }

    /// Whether instances hold object references.
    #[must_use]
    pub fn contains_pointers(&self) -> bool {
        self.flags.contains(TypeFlags::CONTAINS_POINTERS)
    }

    /// Whether this is the free filler type.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.flags.contains(TypeFlags::FREE)
    }

    /// Whether this is an array type.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.flags.contains(TypeFlags::ARRAY)
    }

    /// Whether this is `System.String`.
    #[must_use]
    pub fn is_string(&self) -> bool {
        self.flags.contains(TypeFlags::STRING)
    }

    /// Smallest size any object may occupy: header, method table and one slot.
    #[must_use]
    pub fn min_object_size(&self) -> u64 {
        3 * self.pointer_size.bytes_u64()
    }

    /// Size of the instance at `address`, before alignment.
    ///
    /// Variable-size types read their component count from the word after the method
    /// table. Returns `None` if the count cannot be read.
    pub fn object_size(&self, reader: &mut MemoryReader, address: u64) -> Option<u64> {
        let size = if self.component_size == 0 {
            u64::from(self.base_size)
        } else {
            let count = reader.read_u32(address.checked_add(self.pointer_size.bytes_u64())?)?;
            u64::from(self.base_size) + u64::from(self.component_size) * u64::from(count)
        };
        Some(size.max(self.min_object_size()))
    }

    /// Number of elements of the array (or characters of the string) at `address`.
    pub fn component_count(&self, reader: &mut MemoryReader, address: u64) -> Option<u32> {
        if !self.flags.contains(TypeFlags::VARIABLE_SIZE) {
            return None;
        }
        reader.read_u32(address.checked_add(self.pointer_size.bytes_u64())?)
    }

    /// Returns the GC descriptor, decoding it on first use.
    ///
    /// Types without references never decode a descriptor.
    pub fn gc_desc(&self, reader: &mut MemoryReader, max_series: usize) -> Option<Arc<GcDesc>> {
        if !self.contains_pointers() {
            return None;
        }

        if let Ok(state) = self.gc_desc.read() {
            if let GcDescState::Computed(desc) = &*state {
                return desc.clone();
            }
        }

        let mut state = self.gc_desc.write().ok()?;
        if let GcDescState::Computed(desc) = &*state {
            return desc.clone();
        }
        let desc = GcDesc::read(reader, self.method_table, max_series).map(Arc::new);
        if desc.is_none() {
            log::debug!(
                "method table 0x{:x} contains pointers but has no readable GCDesc",
                self.method_table
            );
        }
        *state = GcDescState::Computed(desc.clone());
        desc
    }

    /// Current GCDesc state without triggering a decode.
    #[must_use]
    pub fn gc_desc_state(&self) -> GcDescState {
        self.gc_desc
            .read()
            .map(|state| state.clone())
            .unwrap_or(GcDescState::NotComputed)
    }
}

/// Concurrent cache of resolved types.
#[derive(Debug)]
pub struct TypeCache {
    types: DashMap<(u64, u64), ClrTypeRc>,
    pointer_size: PointerSize,
    free_method_table: u64,
    array_method_table: u64,
}

impl TypeCache {
    /// Creates an empty cache for a runtime with the given special method tables.
    #[must_use]
    pub fn new(pointer_size: PointerSize, free_method_table: u64, array_method_table: u64) -> Self {
        TypeCache {
            types: DashMap::new(),
            pointer_size,
            free_method_table,
            array_method_table,
        }
    }

    /// Method table of free objects.
    #[must_use]
    pub fn free_method_table(&self) -> u64 {
        self.free_method_table
    }

    /// Method table shared by reference arrays.
    #[must_use]
    pub fn array_method_table(&self) -> u64 {
        self.array_method_table
    }

    /// Number of cached types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the cache holds no types.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns a cached type without resolving.
    #[must_use]
    pub fn get(&self, method_table: u64, component_method_table: u64) -> Option<ClrTypeRc> {
        self.types
            .get(&(method_table, component_method_table))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns every cached type, ordered by key.
    #[must_use]
    pub fn types(&self) -> Vec<ClrTypeRc> {
        let mut entries: Vec<((u64, u64), ClrTypeRc)> = self
            .types
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by_key(|(key, _)| *key);
        entries.into_iter().map(|(_, ty)| ty).collect()
    }

    /// Resolves `(method_table, component_method_table)`, consulting the cache first.
    ///
    /// Returns `None` if the runtime does not know the method table, the type has no
    /// owning module, or it has a null token without being free, an array or a string.
    /// Failed resolutions are not cached.
    pub fn get_or_create(
        &self,
        method_table: u64,
        component_method_table: u64,
        provider: &dyn RuntimeProvider,
    ) -> Option<ClrTypeRc> {
        let key = (method_table, component_method_table);
        if let Some(ty) = self.types.get(&key) {
            return Some(Arc::clone(ty.value()));
        }

        let ty = Arc::new(self.resolve(method_table, component_method_table, provider)?);
        Some(Arc::clone(self.types.entry(key).or_insert(ty).value()))
    }

    fn resolve(
        &self,
        method_table: u64,
        component_method_table: u64,
        provider: &dyn RuntimeProvider,
    ) -> Option<ClrType> {
        if method_table == 0 {
            return None;
        }

        let data = provider.method_table_data(method_table)?;
        let is_free = method_table == self.free_method_table;
        let is_shared_array = method_table == self.array_method_table;

        let kind = if is_free {
            ElementKind::Free
        } else if is_shared_array {
            ElementKind::Array
        } else {
            data.kind
        };

        let mut flags = TypeFlags::empty();
        if data.contains_pointers {
            flags |= TypeFlags::CONTAINS_POINTERS;
        }
        if data.component_size != 0 {
            flags |= TypeFlags::VARIABLE_SIZE;
        }
        match kind {
            ElementKind::Free => flags |= TypeFlags::FREE,
            ElementKind::Array => flags |= TypeFlags::ARRAY,
            ElementKind::String => flags |= TypeFlags::STRING,
            _ => {}
        }
        if is_shared_array {
            flags |= TypeFlags::SHARED_ARRAY;
        }

        let module = if is_free {
            provider.module_for_method_table(method_table).unwrap_or(0)
        } else {
            provider.module_for_method_table(method_table)?
        };

        let exempt = flags.intersects(TypeFlags::FREE | TypeFlags::ARRAY | TypeFlags::STRING);
        if !data.token.is_type() && !exempt {
            if data.token.is_null() {
                log::trace!("method table 0x{method_table:x} has a null token; not a valid type");
            } else {
                log::trace!(
                    "method table 0x{method_table:x} has token {}; not a type definition",
                    data.token
                );
            }
            return None;
        }

        let component_type = if component_method_table != 0 {
            self.get_or_create(component_method_table, 0, provider)
        } else {
            None
        };

        let name = provider.type_name(method_table).or_else(|| {
            if is_free {
                Some("Free".to_string())
            } else {
                component_type
                    .as_ref()
                    .and_then(|component| component.name())
                    .map(|element| format!("{element}[]"))
            }
        });

        Some(ClrType {
            method_table,
            component_method_table,
            kind,
            flags,
            base_size: data.base_size,
            component_size: data.component_size,
            token: data.token,
            module,
            parent: data.parent,
            name,
            component_type,
            pointer_size: self.pointer_size,
            gc_desc: RwLock::new(GcDescState::NotComputed),
        })
    }
}
