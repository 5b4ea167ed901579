//! Cross-checks against dosfstools and mtools. Each test returns early
//! when the host tools are not installed.

mod common;

use std::path::PathBuf;
use std::process::Command;

use common::*;
use fatcore::{MemoryDisk, Volume};

fn tools_available() -> bool {
    ["mkfs.msdos", "mtype", "mcopy", "mdir"].iter().all(|tool| {
        Command::new(tool)
            .arg("--version")
            .output()
            .is_ok()
    })
}

fn image_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("fatcore_tests");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{}.img", name))
}

fn mkfs_floppy(name: &str) -> PathBuf {
    let path = image_path(name);
    let _ = std::fs::remove_file(&path);
    let status = Command::new("mkfs.msdos")
        .args(["-C", path.to_str().unwrap(), "1440"])
        .output()
        .expect("failed to run mkfs.msdos");
    assert!(
        status.status.success(),
        "mkfs.msdos failed: {}",
        String::from_utf8_lossy(&status.stderr)
    );
    path
}

fn mtype(path: &PathBuf, name: &str) -> Vec<u8> {
    let output = Command::new("mtype")
        .env("MTOOLS_SKIP_CHECK", "1")
        .args(["-i", path.to_str().unwrap(), &format!("::{}", name)])
        .output()
        .expect("failed to run mtype");
    assert!(output.status.success(), "mtype {} failed", name);
    output.stdout
}

fn mdir(path: &PathBuf) -> String {
    let output = Command::new("mdir")
        .env("MTOOLS_SKIP_CHECK", "1")
        .args(["-i", path.to_str().unwrap(), "::"])
        .output()
        .expect("failed to run mdir");
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn mcopy_in(path: &PathBuf, content: &[u8], dest: &str) {
    let source = path.with_extension("src");
    std::fs::write(&source, content).unwrap();
    let status = Command::new("mcopy")
        .env("MTOOLS_SKIP_CHECK", "1")
        .args([
            "-D",
            "o",
            "-i",
            path.to_str().unwrap(),
            source.to_str().unwrap(),
            &format!("::{}", dest),
        ])
        .output()
        .expect("failed to run mcopy");
    assert!(
        status.status.success(),
        "mcopy failed: {}",
        String::from_utf8_lossy(&status.stderr)
    );
}

#[test]
fn mtools_reads_what_we_write() {
    if !tools_available() {
        eprintln!("skipping: dosfstools/mtools not installed");
        return;
    }
    let path = mkfs_floppy("we_write");
    let disk = MemoryDisk::from_bytes(std::fs::read(&path).unwrap());
    let volume = Volume::mount(disk.clone(), config()).unwrap();
    let mut root = volume.root_directory().unwrap();
    let big = pattern(20_000);
    create_file(&mut root, "SHORT.TXT", b"Hello, FAT filesystem!");
    create_file(&mut root, "A rather long file name.bin", &big);
    drop(root);
    volume.close().unwrap();
    std::fs::write(&path, disk.snapshot()).unwrap();

    assert_eq!(mtype(&path, "SHORT.TXT"), b"Hello, FAT filesystem!");
    assert_eq!(mtype(&path, "A rather long file name.bin"), big);
    let listing = mdir(&path);
    assert!(listing.contains("A rather long file name.bin"));
}

#[test]
fn we_read_what_mtools_writes() {
    if !tools_available() {
        eprintln!("skipping: dosfstools/mtools not installed");
        return;
    }
    let path = mkfs_floppy("they_write");
    let body = pattern(3000);
    mcopy_in(&path, b"pre-existing content", "PRE.TXT");
    mcopy_in(&path, &body, "Mixed Case Long Name.dat");

    let disk = MemoryDisk::from_bytes(std::fs::read(&path).unwrap());
    let volume = Volume::mount(disk, config()).unwrap();
    let mut root = volume.root_directory().unwrap();

    let pre = root.lookup("pre.txt").unwrap().expect("PRE.TXT listed");
    let handle = root.open_entry(pre.entry_slot()).unwrap();
    assert_eq!(read_all(&handle), b"pre-existing content");

    let long = root
        .lookup("Mixed Case Long Name.dat")
        .unwrap()
        .expect("long name resolved");
    assert_eq!(long.long_name.as_deref(), Some("Mixed Case Long Name.dat"));
    let handle = root.open_entry(long.entry_slot()).unwrap();
    assert_eq!(read_all(&handle), body);
}
