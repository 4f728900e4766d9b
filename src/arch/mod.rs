//! Per-architecture QEMU options.
//!
//! Each supported architecture implements [`ArchOptions`]; the runner picks
//! one from the `arch` tag in the config when it is constructed and never
//! inspects the variant again.

mod arm64;
mod x86_64;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::Config;
use crate::error::{Error, Result};

pub use arm64::Arm64Options;
pub use x86_64::X86_64Options;

/// Android product directory inside a built tree.
const ANDROID_PRODUCT_DIR: &str = "out/target/product/trusty";

/// Supported architecture tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    X86_64,
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "arm" | "arm64" | "aarch64" => Ok(Arch::Arm64),
            "x86_64" | "x86-64" => Ok(Arch::X86_64),
            other => Err(Error::Config(format!("unsupported arch `{}`", other))),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Arm64 => write!(f, "arm64"),
            Arch::X86_64 => write!(f, "x86_64"),
        }
    }
}

impl Arch {
    /// Architecture named by the config. There is no default.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.arch.as_deref() {
            Some(tag) => tag.parse(),
            None => Err(Error::Config("Architecture unspecified or unsupported!".into())),
        }
    }

    pub fn options(self, config: &Config) -> Box<dyn ArchOptions> {
        match self {
            Arch::Arm64 => Box::new(Arm64Options::new(config.clone())),
            Arch::X86_64 => Box::new(X86_64Options::new(config.clone())),
        }
    }
}

/// Option builders for one architecture. Every method returns launch-argument tokens.
pub trait ArchOptions: Send + Sync {
    /// `-machine ...`. Kept separate so device-tree generation can extend it.
    fn machine_options(&self) -> Vec<String>;

    /// CPU, memory and display options.
    fn basic_options(&self) -> Vec<String>;

    /// Firmware image.
    fn bios_options(&self) -> Vec<String>;

    /// Kernel image and command line. Requires `linux` in the config.
    fn linux_options(&self) -> Result<Vec<String>>;

    /// Android disk images. Order is significant: the kernel command line
    /// names its root by device letter.
    fn android_drives_args(&self) -> Result<Vec<String>>;

    /// Patched device tree written to `out`, returned as extra arguments.
    /// `args` is the launch line assembled so far (without `-machine`).
    fn gen_dtb(&self, args: &[String], out: &Path) -> Result<Vec<String>>;

    /// Storage file handed to the RPMB daemon.
    fn rpmb_data_path(&self) -> PathBuf;

    /// Plumbing for the RPMB daemon socket into the guest.
    fn rpmb_options(&self, sock: &Path) -> Vec<String>;

    /// Userdata payload pushed to the device once it is up.
    fn android_user_data(&self) -> Result<PathBuf>;
}

pub(crate) fn android_dir(config: &Config) -> Result<&Path> {
    config
        .android
        .as_deref()
        .ok_or_else(|| Error::Config("no Android tree configured".into()))
}

pub(crate) fn linux_dir(config: &Config) -> Result<&Path> {
    config
        .linux
        .as_deref()
        .ok_or_else(|| Error::Config("no Linux tree configured".into()))
}

pub(crate) fn product_dir(config: &Config) -> Result<PathBuf> {
    Ok(android_dir(config)?.join(ANDROID_PRODUCT_DIR))
}

/// Map `<product>/<image>.img` to drive `index` on a virtio block device.
pub(crate) fn drive_args(product: &Path, image: &str, index: u8, device: &str) -> Vec<String> {
    let letter = char::from(b'a' + index);
    vec![
        "-drive".into(),
        format!(
            "file={}/{}.img,index={},if=none,id=hd{},format=raw,snapshot=on",
            product.display(),
            image,
            index,
            letter
        ),
        "-device".into(),
        format!("{},drive=hd{}", device, letter),
    ]
}

/// Userdata, vendor, system: the first `-drive` becomes /dev/vda.
pub(crate) fn android_drives(product: &Path, device: &str) -> Vec<String> {
    let mut args = drive_args(product, "userdata", 2, device);
    args.extend(drive_args(product, "vendor", 1, device));
    args.extend(drive_args(product, "system", 0, device));
    args
}

pub(crate) fn to_args(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|s| s.to_string()).collect()
}
