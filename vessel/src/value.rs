//! Boxed values.
//!
//! A [`Payload`] is what the VM hands across the boundary: raw scalar bits or
//! an object reference. A [`Storable`] pairs a payload with its [`TypeId`]
//! and owns it.
//!
//! Scalar bits are canonical: the value's little-endian bytes, zero-extended
//! to 64 bits, so only the low `scalar_size` bytes are ever meaningful.
use crate::{ObjectRef, Result, RuntimeError, TypeId};

#[derive(Debug, Clone)]
pub enum Payload {
    Scalar(u64),
    Object(Option<ObjectRef>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Scalar(0)
    }
}

impl Payload {
    #[inline]
    pub fn primitive<T: Primitive>(value: T) -> Self {
        Payload::Scalar(value.to_bits())
    }

    #[inline]
    pub fn object(object: ObjectRef) -> Self {
        Payload::Object(Some(object))
    }

    #[inline]
    pub fn null() -> Self {
        Payload::Object(None)
    }

    pub fn as_primitive<T: Primitive>(&self) -> Option<T> {
        match self {
            Payload::Scalar(bits) => Some(T::from_bits(*bits)),
            Payload::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Payload::Object(object) => object.as_ref(),
            Payload::Scalar(_) => None,
        }
    }

    pub fn into_object(self) -> Option<ObjectRef> {
        match self {
            Payload::Object(object) => object,
            Payload::Scalar(_) => None,
        }
    }
}

/// Rust types that map onto a scalar [`TypeId`].
pub trait Primitive: Copy + Send + Sync + 'static {
    const TYPE_ID: TypeId;
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_integer_primitive {
    ($($ty:ty as $unsigned:ty => $id:ident),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const TYPE_ID: TypeId = TypeId::$id;
                #[inline]
                fn to_bits(self) -> u64 {
                    self as $unsigned as u64
                }
                #[inline]
                fn from_bits(bits: u64) -> Self {
                    bits as $unsigned as $ty
                }
            }
        )*
    };
}

impl_integer_primitive! {
    i8 as u8 => INT8,
    i16 as u16 => INT16,
    i32 as u32 => INT32,
    i64 as u64 => INT64,
    u8 as u8 => UINT8,
    u16 as u16 => UINT16,
    u32 as u32 => UINT32,
    u64 as u64 => UINT64,
}

impl Primitive for bool {
    const TYPE_ID: TypeId = TypeId::BOOL;
    fn to_bits(self) -> u64 {
        self as u64
    }
    fn from_bits(bits: u64) -> Self {
        bits & 0xFF != 0
    }
}

impl Primitive for f32 {
    const TYPE_ID: TypeId = TypeId::FLOAT;
    fn to_bits(self) -> u64 {
        f32::to_bits(self) as u64
    }
    fn from_bits(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl Primitive for f64 {
    const TYPE_ID: TypeId = TypeId::DOUBLE;
    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }
    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

#[inline]
pub(crate) fn truncate_bits(bits: u64, size: usize) -> u64 {
    if size >= 8 {
        bits
    } else {
        bits & ((1u64 << (size * 8)) - 1)
    }
}

pub(crate) fn scalar_as_i64(bits: u64, type_id: TypeId) -> i64 {
    match type_id {
        TypeId::BOOL => (bits & 0xFF != 0) as i64,
        TypeId::INT8 => bits as u8 as i8 as i64,
        TypeId::INT16 => bits as u16 as i16 as i64,
        TypeId::INT64 | TypeId::UINT64 => bits as i64,
        TypeId::UINT8 => bits as u8 as i64,
        TypeId::UINT16 => bits as u16 as i64,
        TypeId::UINT32 => bits as u32 as i64,
        TypeId::FLOAT => f32::from_bits(bits as u32) as i64,
        TypeId::DOUBLE => f64::from_bits(bits) as i64,
        // int32 and enums
        _ => bits as u32 as i32 as i64,
    }
}

pub(crate) fn scalar_as_f64(bits: u64, type_id: TypeId) -> f64 {
    match type_id {
        TypeId::FLOAT => f32::from_bits(bits as u32) as f64,
        TypeId::DOUBLE => f64::from_bits(bits),
        TypeId::UINT64 => bits as f64,
        other => scalar_as_i64(bits, other) as f64,
    }
}

/// Copy-constructs a value object through its type's copy behavior.
pub fn copy_object(object: &ObjectRef) -> Option<ObjectRef> {
    let copy = object.type_info().behaviors.copy.clone()?;
    copy(object)
}

fn incompatible(expected: TypeId, found: TypeId) -> RuntimeError {
    RuntimeError::IncompatibleType {
        expected: format!("{expected:?}"),
        found: format!("{found:?}"),
    }
}

/// Produces the payload a container owns for `value` declared as `type_id`:
/// handles are shared, value objects copied, scalars truncated to width.
pub(crate) fn copy_in(value: &Payload, type_id: TypeId) -> Result<Payload> {
    if type_id.is_void() {
        return Ok(Payload::Scalar(0));
    }
    if type_id.is_handle() {
        return match value {
            Payload::Object(object) => Ok(Payload::Object(object.clone())),
            Payload::Scalar(_) => Err(incompatible(type_id, TypeId::UINT64)),
        };
    }
    if type_id.is_object() {
        return match value {
            Payload::Object(Some(object)) => copy_object(object)
                .map(Payload::object)
                .ok_or_else(|| RuntimeError::CopyFailed(object.type_info().name.clone())),
            Payload::Object(None) => {
                Err(RuntimeError::CopyFailed(format!("null {type_id:?}")))
            }
            Payload::Scalar(_) => Err(incompatible(type_id, TypeId::UINT64)),
        };
    }
    let size = type_id.scalar_size().unwrap_or(8);
    match value {
        Payload::Scalar(bits) => Ok(Payload::Scalar(truncate_bits(*bits, size))),
        Payload::Object(_) => Err(incompatible(type_id, type_id.to_handle())),
    }
}

fn ref_cast_compatible(object: &ObjectRef, declared: TypeId, requested: TypeId) -> bool {
    requested.base() == declared.base() || object.type_info().id == requested.base()
}

/// A value together with its type, owning whatever the payload references.
#[derive(Debug, Default)]
pub struct Storable {
    type_id: TypeId,
    payload: Payload,
}

impl Storable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_primitive<T: Primitive>(value: T) -> Self {
        Self {
            type_id: T::TYPE_ID,
            payload: Payload::primitive(value),
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        self.type_id.is_void()
    }

    pub fn object(&self) -> Option<&ObjectRef> {
        self.payload.as_object()
    }

    /// Overwrites the value with an exact copy of `value`. On failure the
    /// previous value is kept.
    pub fn store(&mut self, value: &Payload, type_id: TypeId) -> Result<()> {
        let payload = copy_in(value, type_id)?;
        self.type_id = type_id;
        self.payload = payload;
        Ok(())
    }

    /// Overwrites the value the way map entries are stored: integers widen to
    /// int64 and floats to double, everything else is stored as is.
    pub fn set(&mut self, value: &Payload, type_id: TypeId) -> Result<()> {
        match value {
            Payload::Scalar(bits) if type_id.is_float() => {
                let widened = scalar_as_f64(*bits, type_id);
                self.store(&Payload::primitive(widened), TypeId::DOUBLE)
            }
            Payload::Scalar(bits) if type_id.is_integer() => {
                let widened = scalar_as_i64(*bits, type_id);
                self.store(&Payload::primitive(widened), TypeId::INT64)
            }
            _ => self.store(value, type_id),
        }
    }

    pub fn set_primitive<T: Primitive>(&mut self, value: T) {
        // scalars cannot fail to store
        let _ = self.set(&Payload::primitive(value), T::TYPE_ID);
    }

    /// Exact retrieval: handles ref-cast, objects must be the identical type,
    /// scalars must have the same width. `out` is untouched on failure.
    pub fn retrieve(&self, out: &mut Payload, type_id: TypeId) -> bool {
        if type_id.is_handle() {
            return self.retrieve_handle(out, type_id);
        }
        if type_id.is_object() {
            if self.type_id != type_id {
                return false;
            }
            let Some(copy) = self.object().and_then(copy_object) else {
                return false;
            };
            *out = Payload::object(copy);
            return true;
        }
        let Payload::Scalar(bits) = self.payload else {
            return false;
        };
        if !self.type_id.is_scalar() && !self.type_id.is_void() {
            return false;
        }
        if type_id.scalar_size() != self.type_id.scalar_size() {
            return false;
        }
        *out = Payload::Scalar(bits);
        true
    }

    fn retrieve_handle(&self, out: &mut Payload, type_id: TypeId) -> bool {
        if !self.type_id.is_object() {
            return false;
        }
        let Payload::Object(stored) = &self.payload else {
            return false;
        };
        let compatible = match stored {
            Some(object) => ref_cast_compatible(object, self.type_id, type_id),
            None => self.type_id.base() == type_id.base(),
        };
        if compatible {
            *out = Payload::Object(stored.clone());
        }
        compatible
    }

    /// Converting retrieval used by map entries.
    ///
    /// Exact type and same-width integer matches copy bits; otherwise bool
    /// targets test for nonzero bytes, 64-bit targets take a widening or
    /// narrowing cast and smaller numeric targets go through a 32-bit
    /// intermediate. Numeric targets are zero-filled when the stored value
    /// is not a number.
    pub fn get(&self, out: &mut Payload, type_id: TypeId) -> bool {
        if type_id.is_handle() {
            return self.retrieve_handle(out, type_id);
        }
        if type_id.is_object() {
            if self.type_id.base() != type_id {
                return false;
            }
            let Some(copy) = self.object().and_then(copy_object) else {
                return false;
            };
            *out = Payload::object(copy);
            return true;
        }
        if type_id.is_void() {
            return false;
        }

        let stored = self.type_id;
        let bits = match self.payload {
            Payload::Scalar(bits) if stored.is_scalar() => bits,
            _ => {
                *out = Payload::Scalar(0);
                return false;
            }
        };

        let same_width_integers = stored.is_integer()
            && type_id.is_integer()
            && stored.scalar_size() == type_id.scalar_size();
        let converted = if type_id == stored || same_width_integers {
            bits
        } else if type_id == TypeId::BOOL {
            let size = stored.scalar_size().unwrap_or(8);
            (truncate_bits(bits, size) != 0) as u64
        } else if type_id == TypeId::INT64 || type_id == TypeId::UINT64 {
            scalar_as_i64(bits, stored) as u64
        } else if type_id == TypeId::DOUBLE {
            scalar_as_f64(bits, stored).to_bits()
        } else if type_id == TypeId::FLOAT {
            (scalar_as_f64(bits, stored) as f32).to_bits() as u64
        } else {
            let narrowed = if stored.is_float() {
                scalar_as_f64(bits, stored) as i32
            } else {
                scalar_as_i64(bits, stored) as i32
            };
            let size = type_id.scalar_size().unwrap_or(4);
            truncate_bits(narrowed as u32 as u64, size)
        };
        *out = Payload::Scalar(converted);
        true
    }

    pub fn get_primitive<T: Primitive>(&self) -> Option<T> {
        let mut out = Payload::default();
        self.get(&mut out, T::TYPE_ID)
            .then(|| out.as_primitive::<T>())
            .flatten()
    }

    /// Copy with value semantics: value objects are copy-constructed,
    /// handles shared.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::new();
        copy.store(&self.payload, self.type_id)?;
        Ok(copy)
    }

    /// Releases the payload and becomes void.
    pub fn clear(&mut self) {
        self.type_id = TypeId::VOID;
        self.payload = Payload::default();
    }

    /// Moves any owned object out, leaving a null of the same type.
    pub(crate) fn take_object(&mut self) -> Option<ObjectRef> {
        match &mut self.payload {
            Payload::Object(object) => object.take(),
            Payload::Scalar(_) => None,
        }
    }

    pub fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        if let Some(object) = self.object() {
            visitor(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tests::{Counted, counted_type};
    use std::sync::{Arc, atomic::AtomicUsize};

    fn stored<T: Primitive>(value: T) -> Storable {
        let mut s = Storable::new();
        s.set_primitive(value);
        s
    }

    #[test]
    fn signed_bits_are_canonical() {
        assert_eq!((-1i32).to_bits(), 0xFFFF_FFFF);
        assert_eq!(i32::from_bits(0xFFFF_FFFF), -1);
        assert_eq!(i8::from_bits((-5i8).to_bits()), -5);
        assert!(bool::from_bits(true.to_bits()));
    }

    #[test]
    fn set_widens_numbers() {
        assert_eq!(stored(7i16).type_id(), TypeId::INT64);
        assert_eq!(stored(7u8).type_id(), TypeId::INT64);
        assert_eq!(stored(1.5f32).type_id(), TypeId::DOUBLE);
        assert_eq!(stored(true).type_id(), TypeId::BOOL);
        assert_eq!(stored(-3i32).get_primitive::<i64>(), Some(-3));
    }

    #[test]
    fn conversions_follow_the_coercion_table() {
        let int = stored(300i32);
        assert_eq!(int.get_primitive::<i32>(), Some(300));
        assert_eq!(int.get_primitive::<f64>(), Some(300.0));
        assert_eq!(int.get_primitive::<bool>(), Some(true));
        // through a 32-bit intermediate, then truncated
        assert_eq!(int.get_primitive::<u8>(), Some(44));

        let float = stored(2.75f64);
        assert_eq!(float.get_primitive::<i64>(), Some(2));
        assert_eq!(float.get_primitive::<i16>(), Some(2));
        assert_eq!(float.get_primitive::<f32>(), Some(2.75));

        let flag = stored(true);
        assert_eq!(flag.get_primitive::<i32>(), Some(1));
        assert_eq!(stored(0i32).get_primitive::<bool>(), Some(false));
    }

    #[test]
    fn objects_do_not_convert_to_numbers() {
        let info = counted_type();
        let drops = Arc::new(AtomicUsize::new(0));
        let object = Counted::create(&info, &drops);

        let mut s = Storable::new();
        s.store(&Payload::object(object.clone()), info.id.to_handle())
            .unwrap();
        assert_eq!(object.ref_count(), 2);

        let mut out = Payload::primitive(99i32);
        assert!(!s.get(&mut out, TypeId::INT32));
        assert_eq!(out.as_primitive::<i32>(), Some(0));

        let mut handle = Payload::null();
        assert!(s.get(&mut handle, info.id.to_handle()));
        assert!(ObjectRef::ptr_eq(handle.as_object().unwrap(), &object));

        s.clear();
        drop(handle);
        assert_eq!(object.ref_count(), 1);
    }

    #[test]
    fn exact_retrieval_rejects_other_widths() {
        let mut s = Storable::new();
        s.store(&Payload::primitive(5i32), TypeId::INT32).unwrap();

        let mut out = Payload::primitive(1i64);
        assert!(!s.retrieve(&mut out, TypeId::INT64));
        assert_eq!(out.as_primitive::<i64>(), Some(1));

        assert!(s.retrieve(&mut out, TypeId::UINT32));
        assert_eq!(out.as_primitive::<u32>(), Some(5));
    }

    #[test]
    fn storing_a_number_as_a_handle_fails_without_change() {
        let mut s = stored(1i32);
        let info = counted_type();
        let err = s
            .store(&Payload::primitive(1i32), info.id.to_handle())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::IncompatibleType { .. }));
        assert_eq!(s.type_id(), TypeId::INT64);
    }
}
