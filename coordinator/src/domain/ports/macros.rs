//! `define_port_error!`: error enums for ports and the services over them.
//!
//! Each variant gets a snake-case constructor taking `impl Into<_>` for every
//! field. A variant written as `Store { message: String } <- SourceError`
//! also gets `From<SourceError>`, carrying the source's display text as the
//! message, so services can use `?` on another port's result:
//!
//! ```ignore
//! define_port_error! {
//!     pub enum ImportError {
//!         Store { message: String } <- RepositoryStoreError =>
//!             "import state store operation failed: {message}",
//!         Cancelled => "import cancelled",
//!     }
//! }
//! ```

macro_rules! define_port_error {
    (@ctor $variant:ident) => {
        ::paste::paste! {
            pub fn [<$variant:snake>]() -> Self {
                Self::$variant
            }
        }
    };

    (@ctor $variant:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        define_port_error!(@ctor_args $variant [] [] $( $field : $ty, )*);
    };

    (@ctor_args $variant:ident [$($params:tt)*] [$($inits:tt)*]) => {
        ::paste::paste! {
            pub fn [<$variant:snake>]($($params)*) -> Self {
                Self::$variant { $($inits)* }
            }
        }
    };

    (@ctor_args $variant:ident [$($params:tt)*] [$($inits:tt)*] $field:ident : $ty:ty, $($rest:tt)*) => {
        define_port_error!(
            @ctor_args
            $variant
            [$($params)* $field: impl Into<$ty>,]
            [$($inits)* $field: $field.into(),]
            $($rest)*
        );
    };

    (@from $name:ident $variant:ident $source:ty) => {
        ::paste::paste! {
            impl From<$source> for $name {
                fn from(err: $source) -> Self {
                    Self::[<$variant:snake>](err.to_string())
                }
            }
        }
    };

    (
        $(#[$outer:meta])*
        pub enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $( { $($field:ident : $ty:ty),* $(,)? } )? $( <- $source:ty )?
                    => $message:expr
            ),* $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
        pub enum $name {
            $(
                $(#[$variant_meta])*
                #[error($message)]
                $variant $( { $($field : $ty),* } )?,
            )*
        }

        impl $name {
            $(
                define_port_error!(@ctor $variant $( { $($field : $ty),* } )?);
            )*
        }

        $(
            $( define_port_error!(@from $name $variant $source); )?
        )*
    };
}

pub(crate) use define_port_error;

#[cfg(test)]
mod tests {
    use super::super::BackendError;

    define_port_error! {
        pub enum WalkError {
            Backend { message: String } <- BackendError => "walk failed: {message}",
            Lagging { storage: String, behind_by: u64 } => "{storage} is {behind_by} generations behind",
            Cancelled => "walk cancelled",
        }
    }

    fn walk(result: Result<(), BackendError>) -> Result<(), WalkError> {
        result?;
        Ok(())
    }

    #[test]
    fn source_errors_become_messages() {
        let err = walk(Err(BackendError::unavailable("gitaly-1", "connection refused")))
            .expect_err("backend failure");

        assert_eq!(
            err,
            WalkError::backend("storage gitaly-1 is unavailable: connection refused")
        );
        assert_eq!(
            err.to_string(),
            "walk failed: storage gitaly-1 is unavailable: connection refused"
        );
    }

    #[test]
    fn constructors_convert_each_field() {
        let err = WalkError::lagging("gitaly-2", 3_u64);
        assert_eq!(err.to_string(), "gitaly-2 is 3 generations behind");
    }

    #[test]
    fn unit_variants_get_constructors() {
        assert_eq!(WalkError::cancelled(), WalkError::Cancelled);
    }
}
