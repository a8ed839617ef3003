mod client;
mod credentials;
mod operations;
mod result;
mod session;
mod webdav;

pub use client::{
    ConnectionValidator, DavClient, DavMethod, DavRequest, DavResponse, TransportError,
};
pub use credentials::Credentials;
pub use operations::RemoteOperation;
pub use result::{RemoteOperationResult, ResultCode, ResultPayload};
pub use session::{AccountSpec, SessionManager};
pub use webdav::{
    RemoteEntry, WEBDAV_FILES_PATH, WebdavError, parse_multistatus, propfind_body,
    user_files_path,
};
