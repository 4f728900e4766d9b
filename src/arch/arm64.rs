//! AArch64 `virt` machine with the secure world enabled.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use super::{android_drives, linux_dir, product_dir, to_args, ArchOptions};
use crate::config::Config;
use crate::error::{Error, Result};

const MACHINE: &str = "virt,secure=on,virtualization=on";

const BASIC_ARGS: &[&str] = &[
    "-nographic",
    "-cpu",
    "cortex-a57",
    "-smp",
    "4",
    "-m",
    "1024",
    "-d",
    "unimp",
    "-semihosting-config",
    "enable,target=native",
    "-no-acpi",
];

const LINUX_CMDLINE: &str = "earlyprintk console=ttyAMA0,38400 keep_bootcon \
     loglevel=7 androidboot.selinux=permissive \
     root=/dev/vda init=/init androidboot.hardware=qemu_trusty";

pub struct Arm64Options {
    config: Config,
}

impl Arm64Options {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn dtc(&self) -> Result<PathBuf> {
        Ok(linux_dir(&self.config)?.join("scripts/dtc/dtc"))
    }

    /// Have QEMU write out the device tree it would generate for `args`.
    fn dump_dtb(&self, args: &[String], out: &Path) -> Result<()> {
        let status = Command::new(&self.config.qemu)
            .arg("-machine")
            .arg(format!("{},dumpdtb={}", MACHINE, out.display()))
            // A paused CPU would keep QEMU from exiting after the dump.
            .args(args.iter().filter(|a| a.as_str() != "-S"))
            .stdin(Stdio::null())
            .status()
            .map_err(|source| Error::Launch {
                program: self.config.qemu.display().to_string(),
                source,
            })?;
        if !status.success() {
            return Err(Error::Generic(format!(
                "dumping dtb failed with {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

impl ArchOptions for Arm64Options {
    fn machine_options(&self) -> Vec<String> {
        vec!["-machine".into(), MACHINE.into()]
    }

    fn basic_options(&self) -> Vec<String> {
        to_args(BASIC_ARGS)
    }

    fn bios_options(&self) -> Vec<String> {
        vec![
            "-bios".into(),
            self.config.atf.join("bl1.bin").display().to_string(),
        ]
    }

    fn linux_options(&self) -> Result<Vec<String>> {
        let linux_arch = self.config.linux_arch.as_deref().unwrap_or("arm64");
        let image = linux_dir(&self.config)?
            .join("arch")
            .join(linux_arch)
            .join("boot/Image");
        Ok(vec![
            "-kernel".into(),
            image.display().to_string(),
            "-append".into(),
            LINUX_CMDLINE.into(),
        ])
    }

    fn android_drives_args(&self) -> Result<Vec<String>> {
        Ok(android_drives(&product_dir(&self.config)?, "virtio-blk-device"))
    }

    fn gen_dtb(&self, args: &[String], out: &Path) -> Result<Vec<String>> {
        let dtc = self.dtc()?;
        let dumped = tempfile::Builder::new().prefix("qemu-dtb").tempfile()?;
        self.dump_dtb(args, dumped.path())?;

        let decompiled = Command::new(&dtc)
            .args(["-q", "-O", "dts"])
            .arg(dumped.path())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|source| Error::Launch {
                program: dtc.display().to_string(),
                source,
            })?;
        if !decompiled.status.success() {
            return Err(Error::Generic(format!(
                "dtb_to_dts failed with {}",
                decompiled.status.code().unwrap_or(-1)
            )));
        }

        let mut dts = decompiled.stdout;
        let firmware = self.config.atf.join("firmware.android.dts");
        dts.extend(fs::read(&firmware).map_err(|e| {
            Error::Generic(format!("cannot read {}: {}", firmware.display(), e))
        })?);

        let mut compile = Command::new(&dtc)
            .args(["-q", "-O", "dtb"])
            .stdin(Stdio::piped())
            .stdout(Stdio::from(File::create(out)?))
            .spawn()
            .map_err(|source| Error::Launch {
                program: dtc.display().to_string(),
                source,
            })?;
        if let Some(mut stdin) = compile.stdin.take() {
            stdin.write_all(&dts)?;
        }
        let status = compile.wait()?;
        if !status.success() {
            return Err(Error::Generic(format!(
                "dts_to_dtb failed with {}",
                status.code().unwrap_or(-1)
            )));
        }
        debug!(dtb = %out.display(), "generated device tree");
        Ok(vec!["-dtb".into(), out.display().to_string()])
    }

    fn rpmb_data_path(&self) -> PathBuf {
        self.config.atf.join("RPMB_DATA")
    }

    fn rpmb_options(&self, sock: &Path) -> Vec<String> {
        vec![
            "-device".into(),
            "virtio-serial".into(),
            "-device".into(),
            "virtserialport,chardev=rpmb0,name=rpmb0".into(),
            "-chardev".into(),
            format!("socket,id=rpmb0,path={}", sock.display()),
        ]
    }

    fn android_user_data(&self) -> Result<PathBuf> {
        Ok(product_dir(&self.config)?.join("data"))
    }
}
