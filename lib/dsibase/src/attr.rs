//! Attribute containers for both ends of a service interface and the
//! partial-update codec for sequence-valued attributes.

use crate::istream::{Deserialize, IStream};
use crate::ostream::{OStream, Serialize};
use crate::wire::{DataState, UpdateType};

/// Server-owned attribute value. Starts out as not available, becomes valid
/// on the first assignment and invalid on an explicit invalidate (the last
/// value is preserved).
#[derive(Debug, Default, Clone)]
pub struct ServerAttribute<T> {
    value: T,
    state: DataState,
}

impl<T> ServerAttribute<T> {
    #[inline]
    pub fn get(&self) -> &T {
        &self.value
    }

    #[inline]
    pub fn state(&self) -> DataState {
        self.state
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state == DataState::Ok
    }

    #[inline]
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.state = DataState::Ok;
    }

    #[inline]
    pub fn invalidate(&mut self) {
        self.state = DataState::Invalid;
    }
}

impl<T: PartialEq> PartialEq<T> for ServerAttribute<T> {
    #[inline]
    fn eq(&self, other: &T) -> bool {
        self.value == *other
    }
}

impl<T: Clone> ServerAttribute<Vec<T>> {
    /// Apply a partial update to a sequence attribute. A negative position
    /// is treated as zero, a negative delete count means "remainder from
    /// position". The attribute becomes valid.
    pub fn update(&mut self, from: &[T], kind: UpdateType, position: i16, count: i16) {
        let position = if position < 0 { 0 } else { position as usize };

        match kind {
            UpdateType::Complete => {
                self.value = from.to_vec();
            }
            UpdateType::Insert => {
                let position = position.min(self.value.len());
                self.value.splice(position..position, from.iter().cloned());
            }
            UpdateType::Replace => {
                let position = position.min(self.value.len());
                let end = (position + from.len()).min(self.value.len());
                self.value[position..end].clone_from_slice(&from[..end - position]);
            }
            UpdateType::Delete => {
                let position = position.min(self.value.len());
                let count = if count < 0 {
                    self.value.len() - position
                } else {
                    (count as usize).min(self.value.len() - position)
                };
                self.value.drain(position..position + count);
            }
            UpdateType::None => (),
        }

        self.state = DataState::Ok;
    }
}

/// Client-side mirror of a server attribute. The value is only meaningful
/// while the state is valid; an invalidation preserves the last value.
#[derive(Debug, Default, Clone)]
pub struct ClientAttribute<T> {
    pub value: T,
    state: DataState,
}

impl<T> ClientAttribute<T> {
    #[inline]
    pub fn get(&self) -> &T {
        &self.value
    }

    #[inline]
    pub fn state(&self) -> DataState {
        self.state
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state == DataState::Ok
    }

    #[inline]
    pub fn set_state(&mut self, state: DataState) {
        self.state = state;
    }

    /// Back to not-available, e.g. when the providing server disconnects.
    #[inline]
    pub fn reset(&mut self) {
        self.state = DataState::NotAvailable;
    }
}

/// Serialize a partial update of a sequence attribute: update type,
/// position, count, then the delta slice (empty for a delete). `items` is
/// the attribute value after the update has been applied on the server.
pub fn write_partial<T: Serialize>(
    os: &mut OStream,
    items: &[T],
    kind: UpdateType,
    position: i16,
    count: i16,
) {
    let position = if position < 0 { 0 } else { position };
    let count = if count < 0 {
        items.len() as i16 - position
    } else {
        count
    };

    os.write_i32(kind as i32);
    os.write_i16(position);
    os.write_i16(count);

    let size = if kind == UpdateType::Delete { 0 } else { count as i32 };
    os.write_i32(size);

    let first = position as usize;
    for item in items.iter().skip(first).take(size as usize) {
        item.serialize(os);
    }
}

/// Read a partial update and apply it to the local copy of the attribute,
/// returning what kind of change happened and where. Malformed updates
/// (e.g. a replace reaching past the end) latch the stream error.
pub fn read_partial<T: Deserialize>(
    is: &mut IStream,
    target: &mut Vec<T>,
) -> (UpdateType, i16, i16) {
    let kind = UpdateType::from_i32(is.read_i32());
    let position = is.read_i16();
    let count = is.read_i16();
    let mut delta: Vec<T> = Deserialize::deserialize(is);

    if is.has_error() {
        return (kind, position, count);
    }

    let at = if position < 0 { 0 } else { position as usize };

    match kind {
        UpdateType::Complete => {
            std::mem::swap(target, &mut delta);
        }
        UpdateType::Insert => {
            if at <= target.len() {
                target.splice(at..at, delta.into_iter());
            } else {
                is.set_error();
            }
        }
        UpdateType::Replace => {
            if at + delta.len() <= target.len() {
                target.splice(at..at + delta.len(), delta.into_iter());
            } else {
                is.set_error();
            }
        }
        UpdateType::Delete => {
            let end = if count < 0 {
                target.len()
            } else {
                at + count as usize
            };

            if at <= end && end <= target.len() {
                target.drain(at..end);
            } else {
                is.set_error();
            }
        }
        UpdateType::None => (),
    }

    (kind, position, count)
}
