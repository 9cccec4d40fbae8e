use serde::{Deserialize, Serialize};

/// Logical endpoint a request targets. `Proxy` forwards the inbound path as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Endpoint {
    ChatComplete,
    Complete,
    Embed,
    ImageGenerate,
    CreateSpeech,
    CreateTranscription,
    CreateTranslation,
    UploadFile,
    ListFiles,
    RetrieveFile,
    DeleteFile,
    RetrieveFileContent,
    CreateBatch,
    RetrieveBatch,
    CancelBatch,
    ListBatches,
    GetBatchOutput,
    CreateFinetune,
    ListFinetunes,
    RetrieveFinetune,
    CancelFinetune,
    Proxy,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::ChatComplete => "chatComplete",
            Endpoint::Complete => "complete",
            Endpoint::Embed => "embed",
            Endpoint::ImageGenerate => "imageGenerate",
            Endpoint::CreateSpeech => "createSpeech",
            Endpoint::CreateTranscription => "createTranscription",
            Endpoint::CreateTranslation => "createTranslation",
            Endpoint::UploadFile => "uploadFile",
            Endpoint::ListFiles => "listFiles",
            Endpoint::RetrieveFile => "retrieveFile",
            Endpoint::DeleteFile => "deleteFile",
            Endpoint::RetrieveFileContent => "retrieveFileContent",
            Endpoint::CreateBatch => "createBatch",
            Endpoint::RetrieveBatch => "retrieveBatch",
            Endpoint::CancelBatch => "cancelBatch",
            Endpoint::ListBatches => "listBatches",
            Endpoint::GetBatchOutput => "getBatchOutput",
            Endpoint::CreateFinetune => "createFinetune",
            Endpoint::ListFinetunes => "listFinetunes",
            Endpoint::RetrieveFinetune => "retrieveFinetune",
            Endpoint::CancelFinetune => "cancelFinetune",
            Endpoint::Proxy => "proxy",
        }
    }

    /// Path appended to a provider's base URL. Endpoints keyed by an id
    /// (retrieve/delete/cancel) and `Proxy` derive the path from the inbound
    /// request instead.
    pub fn default_path(self) -> Option<&'static str> {
        match self {
            Endpoint::ChatComplete => Some("/chat/completions"),
            Endpoint::Complete => Some("/completions"),
            Endpoint::Embed => Some("/embeddings"),
            Endpoint::ImageGenerate => Some("/images/generations"),
            Endpoint::CreateSpeech => Some("/audio/speech"),
            Endpoint::CreateTranscription => Some("/audio/transcriptions"),
            Endpoint::CreateTranslation => Some("/audio/translations"),
            Endpoint::UploadFile | Endpoint::ListFiles => Some("/files"),
            Endpoint::CreateBatch | Endpoint::ListBatches => Some("/batches"),
            Endpoint::CreateFinetune | Endpoint::ListFinetunes => Some("/fine_tuning/jobs"),
            Endpoint::RetrieveFile
            | Endpoint::DeleteFile
            | Endpoint::RetrieveFileContent
            | Endpoint::RetrieveBatch
            | Endpoint::CancelBatch
            | Endpoint::GetBatchOutput
            | Endpoint::RetrieveFinetune
            | Endpoint::CancelFinetune
            | Endpoint::Proxy => None,
        }
    }

    /// File, batch and fine-tune lifecycle endpoints are stateful.
    pub fn is_stateful(self) -> bool {
        matches!(
            self,
            Endpoint::UploadFile
                | Endpoint::ListFiles
                | Endpoint::RetrieveFile
                | Endpoint::DeleteFile
                | Endpoint::RetrieveFileContent
                | Endpoint::CreateBatch
                | Endpoint::RetrieveBatch
                | Endpoint::CancelBatch
                | Endpoint::ListBatches
                | Endpoint::GetBatchOutput
                | Endpoint::CreateFinetune
                | Endpoint::ListFinetunes
                | Endpoint::RetrieveFinetune
                | Endpoint::CancelFinetune
        )
    }

    /// Maps an inbound `/v1/...` path to a named endpoint, falling back to `Proxy`.
    pub fn from_path(method: &str, path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        let path = path.trim_end_matches('/');
        let post = method.eq_ignore_ascii_case("POST");
        match path {
            "/v1/chat/completions" if post => Endpoint::ChatComplete,
            "/v1/completions" if post => Endpoint::Complete,
            "/v1/embeddings" if post => Endpoint::Embed,
            "/v1/images/generations" if post => Endpoint::ImageGenerate,
            "/v1/audio/speech" if post => Endpoint::CreateSpeech,
            "/v1/audio/transcriptions" if post => Endpoint::CreateTranscription,
            "/v1/audio/translations" if post => Endpoint::CreateTranslation,
            "/v1/batches" if post => Endpoint::CreateBatch,
            "/v1/batches" => Endpoint::ListBatches,
            _ => Endpoint::Proxy,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_paths() {
        assert_eq!(
            Endpoint::from_path("POST", "/v1/chat/completions"),
            Endpoint::ChatComplete
        );
        assert_eq!(
            Endpoint::from_path("post", "/v1/embeddings/"),
            Endpoint::Embed
        );
        assert_eq!(Endpoint::from_path("GET", "/v1/batches"), Endpoint::ListBatches);
        assert_eq!(
            Endpoint::from_path("GET", "/v1/chat/completions"),
            Endpoint::Proxy
        );
        assert_eq!(Endpoint::from_path("POST", "/v1/models"), Endpoint::Proxy);
    }

    #[test]
    fn lifecycle_endpoints_are_stateful() {
        assert!(Endpoint::CreateBatch.is_stateful());
        assert!(Endpoint::UploadFile.is_stateful());
        assert!(Endpoint::CancelFinetune.is_stateful());
        assert!(!Endpoint::ChatComplete.is_stateful());
        assert!(!Endpoint::Proxy.is_stateful());
    }
}
