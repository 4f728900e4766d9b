//! x86_64 `q35` machine. Firmware describes the hardware, so there is no device tree.

use std::path::{Path, PathBuf};

use super::{android_drives, linux_dir, product_dir, to_args, ArchOptions};
use crate::config::Config;
use crate::error::Result;

const BASIC_ARGS: &[&str] = &["-nographic", "-cpu", "max", "-smp", "4", "-m", "1024"];

const LINUX_CMDLINE: &str = "earlyprintk console=ttyS0,115200 keep_bootcon \
     loglevel=7 androidboot.selinux=permissive \
     root=/dev/vda init=/init androidboot.hardware=qemu_trusty";

pub struct X86_64Options {
    config: Config,
}

impl X86_64Options {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ArchOptions for X86_64Options {
    fn machine_options(&self) -> Vec<String> {
        vec!["-machine".into(), "q35".into()]
    }

    fn basic_options(&self) -> Vec<String> {
        to_args(BASIC_ARGS)
    }

    fn bios_options(&self) -> Vec<String> {
        vec![
            "-bios".into(),
            self.config.atf.join("bios.bin").display().to_string(),
        ]
    }

    fn linux_options(&self) -> Result<Vec<String>> {
        let linux_arch = self.config.linux_arch.as_deref().unwrap_or("x86");
        let image = linux_dir(&self.config)?
            .join("arch")
            .join(linux_arch)
            .join("boot/bzImage");
        Ok(vec![
            "-kernel".into(),
            image.display().to_string(),
            "-append".into(),
            LINUX_CMDLINE.into(),
        ])
    }

    fn android_drives_args(&self) -> Result<Vec<String>> {
        Ok(android_drives(&product_dir(&self.config)?, "virtio-blk-pci"))
    }

    fn gen_dtb(&self, _args: &[String], _out: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn rpmb_data_path(&self) -> PathBuf {
        self.config.atf.join("RPMB_DATA")
    }

    fn rpmb_options(&self, sock: &Path) -> Vec<String> {
        vec![
            "-device".into(),
            "virtio-serial-pci".into(),
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
