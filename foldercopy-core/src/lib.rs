mod client;

pub use client::{
    ApiErrorClass, DriveClient, DriveError, FILE_LINK_KIND, FOLDER_MIME_TYPE, FileList,
    FileMetadata, FileResource, Labels, Owner, PLAIN_TEXT_MIME_TYPE, ParentReference, Permission,
};
pub use reqwest::StatusCode;
