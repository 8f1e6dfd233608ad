//! Tagged-union value container. Service interfaces declare unions of up to
//! 15 alternatives; on the wire the active alternative travels as a 1-based
//! type id followed by its payload, a zero id denotes the empty union.
//!
//! `define_union!` generates one enum per declared union:
//!
//! ```
//! dsibase::define_union! {
//!     pub enum Position {
//!         1 => Absolute(u32) via as_absolute,
//!         2 => Name(String) via as_name,
//!     }
//! }
//!
//! let pos = Position::from(7u32);
//! assert_eq!(pos.type_id(), 1);
//! assert_eq!(pos.as_absolute(), Some(&7));
//! assert_eq!(pos.as_name(), None);
//! ```
//!
//! Decoding an unknown or out-of-range type id resets the union to empty
//! without touching the stream error indicator; the payload of the unknown
//! alternative cannot be skipped, so the remainder of the message is
//! considered consumed by the caller.

/// Generate a tagged-union enum with serialization support.
///
/// Alternatives are listed as `<type id> => <Variant>(<type>) via <accessor>`
/// with type ids dense from 1 in declaration order.
#[macro_export]
macro_rules! define_union {
    ($vis:vis enum $name:ident {
        $($id:expr => $var:ident($ty:ty) via $acc:ident),+ $(,)?
    }) => {
        #[derive(Debug, Clone, PartialEq)]
        $vis enum $name {
            Empty,
            $($var($ty),)+
        }

        // unions carry at most 15 alternatives
        const _: () = {
            let count = 0 $(+ { let _ = $id; 1 })+;
            assert!(count <= 15);
        };

        impl $name {
            /// 1-based id of the active alternative, zero when empty.
            #[inline]
            $vis fn type_id(&self) -> i32 {
                match self {
                    $name::Empty => 0,
                    $($name::$var(_) => $id,)+
                }
            }

            #[inline]
            $vis fn is_empty(&self) -> bool {
                self.type_id() == 0
            }

            /// Reset to the empty state.
            #[inline]
            $vis fn reset(&mut self) {
                *self = $name::Empty;
            }

            $(
                #[inline]
                $vis fn $acc(&self) -> Option<&$ty> {
                    match self {
                        $name::$var(value) => Some(value),
                        _ => None,
                    }
                }
            )+
        }

        impl Default for $name {
            #[inline]
            fn default() -> Self {
                $name::Empty
            }
        }

        $(
            impl From<$ty> for $name {
                #[inline]
                fn from(value: $ty) -> Self {
                    $name::$var(value)
                }
            }
        )+

        impl $crate::ostream::Serialize for $name {
            fn serialize(&self, os: &mut $crate::ostream::OStream) {
                os.write_i32(self.type_id());

                match self {
                    $name::Empty => (),
                    $($name::$var(value) => $crate::ostream::Serialize::serialize(value, os),)+
                }
            }
        }

        impl $crate::istream::Deserialize for $name {
            fn deserialize(is: &mut $crate::istream::IStream) -> Self {
                let type_id = is.read_i32();

                match type_id {
                    $($id => $name::$var(<$ty as $crate::istream::Deserialize>::deserialize(is)),)+
                    _ => $name::Empty,
                }
            }
        }
    };
}
