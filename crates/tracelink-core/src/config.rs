/// Trait for loading service configuration from environment variables.
///
/// Implementors derive `serde::Deserialize` (with `#[serde(default = ...)]`
/// for optional settings) and call `Config::try_from_env()` at startup.
pub trait Config: Sized + serde::de::DeserializeOwned {
    /// Load from the process environment, reporting the first missing or
    /// malformed variable.
    fn try_from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// Load from an explicit list of `(NAME, value)` pairs (tests, tooling).
    fn from_pairs<I>(pairs: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(pairs)
    }
}
