use queue::QueueError;

pub(crate) mod grpc_mapping;

pub(crate) type TonicResult<T> = Result<T, tonic::Status>;

pub(crate) type TonicRespResult<T> = TonicResult<tonic::Response<T>>;

pub(crate) fn queue_error_to_status(err: &QueueError) -> tonic::Status {
    match err {
        QueueError::NoItem(_) => tonic::Status::not_found(err.to_string()),
        QueueError::UnknownWorker(_) | QueueError::HeadAlreadySent(_) => {
            tonic::Status::invalid_argument(err.to_string())
        }
        QueueError::Cancelled => tonic::Status::unavailable(err.to_string()),
    }
}

pub(crate) trait TonicServerOptionExt<T> {
    fn argument_must_exist(self, argument: &str) -> Result<T, tonic::Status>;
}

impl<T> TonicServerOptionExt<T> for Option<T> {
    fn argument_must_exist(self, argument: &str) -> Result<T, tonic::Status> {
        self.ok_or_else(|| {
            tonic::Status::invalid_argument(format!("argument `{argument}` must exist"))
        })
    }
}

pub(crate) trait TonicServerResultExt<T> {
    fn to_status(self) -> Result<T, tonic::Status>;
}

impl<T> TonicServerResultExt<T> for Result<T, QueueError> {
    fn to_status(self) -> Result<T, tonic::Status> {
        self.map_err(|err| queue_error_to_status(&err))
    }
}

/// Parses an identifier argument, rejecting malformed values as `invalid_argument`.
pub(crate) fn parse_argument<T>(value: &str, argument: &str) -> Result<T, tonic::Status>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err| {
        tonic::Status::invalid_argument(format!("argument `{argument}` cannot be parsed - {err}"))
    })
}
