//! Task trait - binds a payload type to its task type string.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A payload type with a fixed task type string.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct UploadMovie {
///     file_path: String,
/// }
///
/// impl Task for UploadMovie {
///     const TYPE: &'static str = "upload-movie";
/// }
/// ```
///
/// Payloads are stored as JSON; `Serialize` on enqueue, `DeserializeOwned`
/// when the handler runs.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
