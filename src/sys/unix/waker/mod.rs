#[cfg(any(target_os = "android", target_os = "linux"))]
mod eventfd;
#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) use eventfd::WakerInternal;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod pipe;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use pipe::WakerInternal;
