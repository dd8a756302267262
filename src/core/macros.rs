/// Status-style enum stored as TEXT: generates `as_str`, `from_status` and `Display`.
///
/// ```ignore
/// crate::text_enum! {
///     RunStatus {
///         Running => "running",
///         Completed => "completed",
///     }
/// }
/// ```
#[macro_export]
macro_rules! text_enum {
    ($enum:ident { $( $variant:ident => $str:literal ),+ $(,)? }) => {
        impl $enum {
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $enum::$variant => $str, )+
                }
            }

            pub fn from_status(value: &str) -> Option<Self> {
                match value {
                    $( $str => Some($enum::$variant), )+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $enum {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $enum {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $enum::from_status(s).ok_or_else(|| {
                    anyhow::anyhow!("invalid {} '{}'", stringify!($enum), s)
                })
            }
        }
    };
}
