//! Messages of the download-URL lookup, the one call the proxy decodes

/// Response of `ConfigFileService/GetFileDownloadUrl`; the request is empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DownloadUrlResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub info: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub url: ::prost::alloc::string::String,
}
