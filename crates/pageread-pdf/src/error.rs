use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind pdfium library: {0}")]
    PdfiumBind(String),

    #[error("failed to load PDF: {0}")]
    PdfLoad(String),

    #[error("failed to render page {page}: {reason}")]
    PageRender { page: usize, reason: String },

    #[error("failed to decode image: {0}")]
    ImageDecode(String),

    #[error("no pages to process (requested {requested}, source has {available})")]
    NoPages { requested: usize, available: usize },

    #[error(transparent)]
    Tensor(#[from] pageread_tensor::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for pageread_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NoPages { .. } => pageread_core::Error::InvalidConfiguration(err.to_string()),
            other => pageread_core::Error::PDFRenderingFailed(other.to_string()),
        }
    }
}
