use thiserror::Error;

/// Stable error taxonomy shared with every SDK binding.
///
/// The numeric values are part of the ABI and must never be renumbered;
/// clients match on the integer, not the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,

    // Generic errors (1-99)
    UnknownError = 1,
    NotInitialized = 2,
    InvalidParameter = 3,
    OperationTimeout = 4,
    OperationCancelled = 5,
    OperationInProgress = 6,
    OperationNotImplemented = 7,
    NetworkError = 8,
    InsufficientMemory = 9,
    NotConnectedToSubservice = 10,

    // Authentication errors (201-204)
    InvalidUsernameOrPassword = 201,
    InvalidToken = 202,
    InvalidAccessCode = 203,
    InvalidPinCode = 204,

    // File transfer errors (300-303)
    FileTransferFailed = 300,
    FileNotFound = 301,
    FileAlreadyExists = 302,
    FileAccessDenied = 303,

    // Printer business errors (1000-1013)
    PrinterNotFound = 1000,
    PrinterConnectionError = 1001,
    PrinterConnectionLimitExceeded = 1002,
    PrinterAlreadyConnected = 1003,
    PrinterBusy = 1004,
    PrinterCommandFailed = 1005,
    PrinterUnknownError = 1006,
    PrinterInvalidParameter = 1007,
    PrinterInvalidResponse = 1008,
    PrinterAccessDenied = 1009,
    PrinterMissingBedLevelingData = 1010,
    PrinterPrintFileNotFound = 1011,
    PrinterOffline = 1012,
    PrinterFilamentRunout = 1013,

    // Server business errors (2000-2051)
    ServerUnknownError = 2000,
    ServerInvalidResponse = 2001,
    ServerTooManyRequests = 2002,
    ServerRtmNotConnected = 2049,
    ServerUnauthorized = 2050,
    ServerForbidden = 2051,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl serde::Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.as_u32())
    }
}

/// Error value returned by every fallible SDK operation.
#[derive(Debug, Clone, Error)]
#[error("{message} (code {})", .code.as_u32())]
pub struct SdkError {
    pub code: ErrorCode,
    pub message: String,
}

impl SdkError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_initialized(what: &str) -> Self {
        Self::new(ErrorCode::NotInitialized, format!("{} is not initialized", what))
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameter, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OperationTimeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OperationCancelled, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn printer_not_found(printer_id: &str) -> Self {
        Self::new(
            ErrorCode::PrinterNotFound,
            format!("Printer not found: {}", printer_id),
        )
    }
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                Self::new(ErrorCode::FileNotFound, err.to_string())
            }
            std::io::ErrorKind::PermissionDenied => {
                Self::new(ErrorCode::FileAccessDenied, err.to_string())
            }
            _ => Self::new(ErrorCode::NetworkError, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::PrinterInvalidResponse, err.to_string())
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(ErrorCode::OperationTimeout, err.to_string())
        } else {
            Self::new(ErrorCode::NetworkError, err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_abi_stable() {
        assert_eq!(ErrorCode::Success.as_u32(), 0);
        assert_eq!(ErrorCode::OperationTimeout.as_u32(), 4);
        assert_eq!(ErrorCode::OperationCancelled.as_u32(), 5);
        assert_eq!(ErrorCode::NotConnectedToSubservice.as_u32(), 10);
        assert_eq!(ErrorCode::InvalidAccessCode.as_u32(), 203);
        assert_eq!(ErrorCode::FileTransferFailed.as_u32(), 300);
        assert_eq!(ErrorCode::PrinterNotFound.as_u32(), 1000);
        assert_eq!(ErrorCode::PrinterFilamentRunout.as_u32(), 1013);
        assert_eq!(ErrorCode::ServerRtmNotConnected.as_u32(), 2049);
        assert_eq!(ErrorCode::ServerForbidden.as_u32(), 2051);
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let err: SdkError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }
}
