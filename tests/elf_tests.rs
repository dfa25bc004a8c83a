// Integration tests for ELF metadata reading and in-place patching
//
// Binaries are synthesised by test_helpers::build_elf, so these run the same
// on every host.


use anyhow::Result;
use pourover::PourError;
use pourover::elf::{ElfArch, ElfFile, ObjectType};
use std::path::PathBuf;
use test_helpers::*;

#[test]
fn test_reads_dynamic_executable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tool");
    write_elf(
        &path,
        &ElfSpec {
            interpreter: Some("/lib64/ld-linux-x86-64.so.2".into()),
            needed: vec!["libz.so.1".into(), "libc.so.6".into()],
            runpath: Some("/opt/pour/lib:$ORIGIN/../lib".into()),
            ..Default::default()
        },
    );

    let elf = ElfFile::new(&path);
    assert!(elf.is_elf());
    assert_eq!(elf.arch(), ElfArch::X86_64);
    assert_eq!(elf.object_type(), ObjectType::Executable);
    assert!(elf.is_executable());
    assert!(!elf.is_dylib());
    assert!(elf.is_dynamic());
    assert_eq!(elf.interpreter(), Some("/lib64/ld-linux-x86-64.so.2"));
    assert_eq!(elf.needed(), ["libz.so.1", "libc.so.6"]);
    assert_eq!(elf.rpath(), Some("/opt/pour/lib:$ORIGIN/../lib"));
    assert_eq!(elf.rpaths(), vec!["/opt/pour/lib", "$ORIGIN/../lib"]);
    assert_eq!(elf.soname(), None);
    Ok(())
}

#[test]
fn test_reads_shared_library() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("libfoo.so.1");
    write_elf(
        &path,
        &ElfSpec {
            e_type: ET_DYN,
            machine: 0xB7,
            soname: Some("libfoo.so.1".into()),
            rpath: Some("/usr/lib".into()),
            ..Default::default()
        },
    );

    let elf = ElfFile::new(&path);
    assert_eq!(elf.arch(), ElfArch::Arm64);
    assert!(elf.is_dylib());
    assert_eq!(elf.soname(), Some("libfoo.so.1"));
    assert_eq!(elf.interpreter(), None);
    assert_eq!(elf.rpath(), Some("/usr/lib"));
    Ok(())
}

#[test]
fn test_runpath_takes_precedence_over_rpath() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("both");
    write_elf(
        &path,
        &ElfSpec {
            rpath: Some("/old/rpath".into()),
            runpath: Some("/new/runpath".into()),
            ..Default::default()
        },
    );

    assert_eq!(ElfFile::new(&path).rpath(), Some("/new/runpath"));
    Ok(())
}

#[test]
fn test_static_binary_has_no_dynamic_metadata() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("static");
    write_elf(
        &path,
        &ElfSpec {
            dynamic: false,
            ..Default::default()
        },
    );

    let elf = ElfFile::new(&path);
    assert!(elf.is_elf());
    assert!(!elf.is_dynamic());
    assert!(elf.needed().is_empty());
    assert!(elf.rpaths().is_empty());
    assert!(elf.needed_libraries().is_empty());
    Ok(())
}

#[test]
fn test_scripts_are_not_elf() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("script");
    std::fs::write(&path, "#!/bin/sh\necho hi\n")?;

    let elf = ElfFile::new(&path);
    assert!(!elf.is_elf());
    assert_eq!(elf.arch(), ElfArch::Unknown);
    assert_eq!(elf.object_type(), ObjectType::Unknown);
    assert!(!elf.is_dynamic());
    assert_eq!(elf.interpreter(), None);
    Ok(())
}

#[test]
fn test_patch_shorter_values_in_place() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tool");
    write_elf(
        &path,
        &ElfSpec {
            interpreter: Some("/tmp/build/prefix/lib/ld.so".into()),
            needed: vec!["libc.so.6".into()],
            runpath: Some("/tmp/build/prefix/lib:/tmp/build/prefix/opt/zlib/lib".into()),
            ..Default::default()
        },
    );
    set_mode(&path, 0o750);
    let size_before = std::fs::metadata(&path)?.len();

    let mut elf = ElfFile::new(&path);
    elf.patch(Some("/opt/p/lib/ld.so"), Some("/opt/p/lib"))?;

    // Cached metadata is dropped after a patch
    assert_eq!(elf.interpreter(), Some("/opt/p/lib/ld.so"));
    assert_eq!(elf.rpath(), Some("/opt/p/lib"));
    assert_eq!(elf.needed(), ["libc.so.6"]);

    let reread = ElfFile::new(&path);
    assert_eq!(reread.interpreter(), Some("/opt/p/lib/ld.so"));
    assert_eq!(reread.rpath(), Some("/opt/p/lib"));

    assert_eq!(std::fs::metadata(&path)?.len(), size_before);
    assert_eq!(mode(&path), 0o750);
    Ok(())
}

#[test]
fn test_patch_with_empty_values_is_a_noop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tool");
    write_elf(
        &path,
        &ElfSpec {
            rpath: Some("/usr/lib".into()),
            ..Default::default()
        },
    );
    let before = std::fs::read(&path)?;

    let mut elf = ElfFile::new(&path);
    elf.patch(Some(""), None)?;
    assert_eq!(std::fs::read(&path)?, before);
    Ok(())
}

#[test]
fn test_patch_too_long_fails_and_leaves_file_untouched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tool");
    write_elf(
        &path,
        &ElfSpec {
            rpath: Some("/lib".into()),
            ..Default::default()
        },
    );
    let before = std::fs::read(&path)?;

    let mut elf = ElfFile::new(&path);
    let err = elf
        .patch(None, Some("/a/much/longer/library/path"))
        .unwrap_err();
    assert!(matches!(err, PourError::Patch { .. }), "got {err:?}");
    assert_eq!(std::fs::read(&path)?, before);
    assert_eq!(elf.rpath(), Some("/lib"));
    Ok(())
}

#[test]
fn test_patch_missing_segment_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tool");
    write_elf(&path, &ElfSpec::default());

    let mut elf = ElfFile::new(&path);
    let err = elf.patch(Some("/lib/ld.so"), None).unwrap_err();
    assert!(matches!(err, PourError::Patch { .. }), "got {err:?}");
    Ok(())
}

// Both ldd cases share one test so the fake tool is never exec'd while
// another thread is still writing it.
#[test]
fn test_needed_libraries_from_ldd() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tool");
    write_elf(
        &path,
        &ElfSpec {
            needed: vec!["libz.so.1".into(), "libstdc++.so.6".into()],
            ..Default::default()
        },
    );

    let ok_dir = dir.path().join("ok");
    std::fs::create_dir(&ok_dir)?;
    let ldd = fake_ldd(
        &ok_dir,
        "\tlinux-vdso.so.1 (0x00007ffc8a5f2000)\n\
         \tlibz.so.1 => /opt/pour/lib/libz.so.1 (0x00007f2a1c000000)\n\
         \tlibstdc++.so.6 => /usr/lib/libstdc++.so.6 (0x00007f2a1be00000)\n\
         \tlibm.so.6 => /usr/lib/libm.so.6 (0x00007f2a1bd00000)",
        0,
    );
    let elf = ElfFile::new(&path).with_ldd(&ldd);
    assert_eq!(
        elf.needed_libraries(),
        [
            PathBuf::from("/opt/pour/lib/libz.so.1"),
            PathBuf::from("/usr/lib/libstdc++.so.6"),
        ]
    );

    let failing_dir = dir.path().join("failing");
    std::fs::create_dir(&failing_dir)?;
    let ldd = fake_ldd(&failing_dir, "\tnot a dynamic executable", 1);
    let elf = ElfFile::new(&path).with_ldd(&ldd);
    assert!(elf.needed_libraries().is_empty());

    let elf = ElfFile::new(&path).with_ldd(dir.path().join("no-such-ldd"));
    assert!(elf.needed_libraries().is_empty());
    Ok(())
}

#[test]
fn test_oversized_load_segment_is_rejected() {
    let mut data = build_elf(&ElfSpec {
        rpath: Some("/opt/pour/lib".into()),
        ..Default::default()
    });
    assert!(pourover::elf::parse_dynamic(&data).is_ok());

    // p_filesz of the PT_LOAD entry, which directly follows the ELF header
    let filesz = 64 + 32;
    data[filesz..filesz + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    assert!(pourover::elf::parse_dynamic(&data).is_err());
}
