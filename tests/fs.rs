//! End-to-end scenarios against an in-memory device.

use std::convert::TryInto;
use std::rc::Rc;

use rand::{rngs::StdRng, RngCore, SeedableRng};

use minfs::{
    Bcache, DirCookie, FsError, MemDisk, Minfs, Vnode, VnodeOps, VnodeType, BLOCK_SIZE, TYPE_DIR,
};

fn bcache(disk: &MemDisk) -> Bcache {
    Bcache::new(Box::new(disk.clone()))
}

fn format(nblocks: u32) -> MemDisk {
    let disk = MemDisk::new(nblocks);
    Minfs::mkfs(&bcache(&disk)).unwrap();
    disk
}

fn mount(disk: &MemDisk) -> Rc<Minfs> {
    Minfs::mount(bcache(disk)).unwrap()
}

/// Drain a directory through the readdir cursor into (name, type) pairs.
fn read_entries(dir: &Vnode) -> Vec<(String, u32)> {
    let mut cookie = DirCookie::new();
    let mut out = vec![0u8; 4096];
    let mut entries = Vec::new();
    loop {
        let n = dir.readdir(&mut cookie, &mut out).unwrap();
        if n == 0 {
            break;
        }
        let mut pos = 0;
        while pos < n {
            let size = u32::from_le_bytes(out[pos..pos + 4].try_into().unwrap()) as usize;
            let typ = u32::from_le_bytes(out[pos + 4..pos + 8].try_into().unwrap());
            let name = &out[pos + 8..pos + size];
            let len = name.iter().position(|&b| b == 0).unwrap();
            entries.push((String::from_utf8(name[..len].to_vec()).unwrap(), typ));
            pos += size;
        }
    }
    entries
}

#[test]
fn mkfs_layout() {
    let disk = format(1024);
    let fs = mount(&disk);
    let info = fs.info();
    assert_eq!(info.ibm_block, 8);
    assert_eq!(info.abm_block, 16);
    assert_eq!(info.ino_block, 24);
    // 32768 inodes at 64 per block
    assert_eq!(info.dat_block, 24 + 512);
    assert_eq!(info.block_count, 1024);
    assert_eq!(info.inode_count, 32768);

    let root = fs.root().unwrap();
    let attr = root.attr().unwrap();
    assert_eq!(attr.ino, 1);
    assert_eq!(attr.vtype, VnodeType::Dir);
    assert_eq!(attr.size, BLOCK_SIZE as u64);
    assert_eq!(attr.link_count, 2);
    assert_eq!(attr.blocks, 1);
}

#[test]
fn mkfs_rejects_tiny_device() {
    let disk = MemDisk::new(100);
    assert_eq!(Minfs::mkfs(&bcache(&disk)).unwrap_err(), FsError::InvalidArgs);
}

#[test]
fn mount_rejects_unformatted_device() {
    let disk = MemDisk::new(1024);
    assert_eq!(Minfs::mount(bcache(&disk)).unwrap_err(), FsError::InvalidArgs);
}

#[test]
fn fresh_root_holds_dot_and_dotdot() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();

    let entries = read_entries(&root);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], (".".to_string(), TYPE_DIR as u32));
    assert_eq!(entries[1], ("..".to_string(), TYPE_DIR as u32));

    // both point back at the root inode
    let dot = root.lookup(b".").unwrap();
    let dotdot = root.lookup(b"..").unwrap();
    assert_eq!(dot.ino(), 1);
    assert_eq!(dotdot.ino(), 1);
    assert!(Rc::ptr_eq(&dot, &root));

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn create_write_remount_read() {
    let disk = format(1024);
    {
        let fs = mount(&disk);
        let root = fs.root().unwrap();
        let foo = root.create(b"foo", VnodeType::File).unwrap();
        assert_eq!(foo.write_at(b"hello", 0).unwrap(), 5);
    }

    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let foo = root.lookup(b"foo").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(foo.read_at(&mut buf, 0).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(foo.attr().unwrap().size, 5);

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn duplicate_create_consumes_no_inode() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();

    let a = root.create(b"a", VnodeType::Dir).unwrap();
    assert_eq!(a.ino(), 2);
    assert_eq!(
        root.create(b"a", VnodeType::File).unwrap_err(),
        FsError::AlreadyExists
    );
    let b = root.create(b"b", VnodeType::File).unwrap();
    assert_eq!(b.ino(), 3);

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn cached_vnodes_are_shared() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    root.create(b"f", VnodeType::File).unwrap();
    let one = root.lookup(b"f").unwrap();
    let two = root.lookup(b"f").unwrap();
    assert!(Rc::ptr_eq(&one, &two));
}

#[test]
fn get_vnode_range_checks() {
    let disk = format(1024);
    let fs = mount(&disk);
    assert_eq!(fs.get_vnode(0).unwrap_err(), FsError::OutOfRange);
    assert_eq!(fs.get_vnode(32768).unwrap_err(), FsError::OutOfRange);
}

#[test]
fn fill_directory_until_no_room() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();

    let mut created = 0u32;
    loop {
        let name = format!("f{:04}", created);
        match root.create(name.as_bytes(), VnodeType::File) {
            Ok(_) => created += 1,
            Err(e) => {
                assert_eq!(e, FsError::NoResources);
                break;
            }
        }
    }
    // "." (12) + ".." (12) leave 8168 bytes; each 5-byte name takes 16
    assert_eq!(created, 510);

    // a full directory still resolves names correctly
    assert_eq!(root.lookup(b"doesnotexist").unwrap_err(), FsError::NotFound);
    assert!(root.lookup(b"f0000").is_ok());
    assert!(root.lookup(b"f0509").is_ok());

    let entries = read_entries(&root);
    assert_eq!(entries.len(), 2 + 510);

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn unlink_frees_name_and_inode() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    {
        let x = root.create(b"x", VnodeType::File).unwrap();
        assert_eq!(x.ino(), 2);
        x.write_at(b"data", 0).unwrap();
    }
    assert_eq!(read_entries(&root).len(), 3);

    root.unlink(b"x").unwrap();
    assert_eq!(root.lookup(b"x").unwrap_err(), FsError::NotFound);
    assert_eq!(read_entries(&root).len(), 2);

    // the inode and its data block came back to the allocators
    let y = root.create(b"y", VnodeType::File).unwrap();
    assert_eq!(y.ino(), 2);

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn unlink_rejects_dot_names_and_nonempty_dirs() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();

    assert_eq!(root.unlink(b".").unwrap_err(), FsError::InvalidArgs);
    assert_eq!(root.unlink(b"..").unwrap_err(), FsError::InvalidArgs);

    let d = root.create(b"d", VnodeType::Dir).unwrap();
    d.create(b"inner", VnodeType::File).unwrap();
    assert_eq!(root.unlink(b"d").unwrap_err(), FsError::BadState);

    d.unlink(b"inner").unwrap();
    root.unlink(b"d").unwrap();
    assert_eq!(root.lookup(b"d").unwrap_err(), FsError::NotFound);

    // the last reference to the unlinked directory frees its blocks
    drop(d);
    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn subdirectory_round_trip() {
    let disk = format(1024);
    {
        let fs = mount(&disk);
        let root = fs.root().unwrap();
        let d = root.create(b"sub", VnodeType::Dir).unwrap();
        assert_eq!(d.attr().unwrap().link_count, 2);
        let f = d.create(b"leaf", VnodeType::File).unwrap();
        f.write_at(b"payload", 0).unwrap();
    }

    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let d = root.lookup(b"sub").unwrap();
    assert!(d.is_dir());
    let entries = read_entries(&d);
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].0, "leaf");
    let dotdot = d.lookup(b"..").unwrap();
    assert_eq!(dotdot.ino(), 1);

    let f = d.lookup(b"leaf").unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(f.read_at(&mut buf, 0).unwrap(), 7);
    assert_eq!(&buf, b"payload");

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn large_file_two_halves() {
    let mut rng = StdRng::seed_from_u64(0x6d69_6e66_7321);
    let mut data = vec![0u8; 102400];
    rng.fill_bytes(&mut data);

    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let f = root.create(b"big", VnodeType::File).unwrap();

    assert_eq!(f.write_at(&data[..51200], 0).unwrap(), 51200);
    assert_eq!(f.write_at(&data[51200..], 51200).unwrap(), 51200);

    let attr = f.attr().unwrap();
    assert_eq!(attr.size, 102400);
    // 100 KiB in 8 KiB blocks: 13 direct pointers, no indirect needed
    assert_eq!(attr.blocks, 13);

    let mut back = vec![0u8; 102400];
    assert_eq!(f.read_at(&mut back, 0).unwrap(), 102400);
    assert_eq!(back, data);

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn file_reaching_into_indirect_blocks() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut data = vec![0u8; 17 * BLOCK_SIZE];
    rng.fill_bytes(&mut data);

    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let f = root.create(b"wide", VnodeType::File).unwrap();
    assert_eq!(f.write_at(&data, 0).unwrap(), data.len());

    // 17 data blocks: 16 direct, 1 behind the first indirect block
    assert_eq!(f.attr().unwrap().blocks, 18);

    let mut back = vec![0u8; data.len()];
    assert_eq!(f.read_at(&mut back, 0).unwrap(), data.len());
    assert_eq!(back, data);

    // an offset read spanning the direct/indirect boundary
    let mut window = vec![0u8; 2 * BLOCK_SIZE];
    let off = 15 * BLOCK_SIZE as u64;
    assert_eq!(f.read_at(&mut window, off).unwrap(), window.len());
    assert_eq!(&window[..], &data[15 * BLOCK_SIZE..]);

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn sparse_files_read_zeroes() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let f = root.create(b"holey", VnodeType::File).unwrap();

    let off = 3 * BLOCK_SIZE as u64;
    assert_eq!(f.write_at(b"end", off).unwrap(), 3);
    let attr = f.attr().unwrap();
    assert_eq!(attr.size, off + 3);
    // reads never materialise the holes
    assert_eq!(attr.blocks, 1);

    let mut buf = [0xffu8; 64];
    assert_eq!(f.read_at(&mut buf, 0).unwrap(), 64);
    assert_eq!(buf, [0u8; 64]);

    let mut tail = [0u8; 3];
    assert_eq!(f.read_at(&mut tail, off).unwrap(), 3);
    assert_eq!(&tail, b"end");
    assert_eq!(f.attr().unwrap().blocks, 1);

    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn write_stops_when_device_fills() {
    // dat_block is 536, so 540 blocks leave three free data blocks
    let disk = format(540);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let f = root.create(b"f", VnodeType::File).unwrap();

    let data = vec![0xabu8; 4 * BLOCK_SIZE];
    assert_eq!(f.write_at(&data, 0).unwrap(), 3 * BLOCK_SIZE);
    assert_eq!(f.attr().unwrap().size, 3 * BLOCK_SIZE as u64);

    // a write with nothing to give fails outright
    assert_eq!(
        f.write_at(&data, 3 * BLOCK_SIZE as u64).unwrap_err(),
        FsError::NoResources
    );

    // the failed allocations left no orphaned bits behind
    Minfs::check(bcache(&disk)).unwrap();
}

#[test]
fn readdir_cursor_poisoned_by_mutation() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    root.create(b"a", VnodeType::File).unwrap();
    root.create(b"b", VnodeType::File).unwrap();

    // a 16-byte window returns "." and stops short
    let mut cookie = DirCookie::new();
    let mut small = [0u8; 16];
    let n = root.readdir(&mut cookie, &mut small).unwrap();
    assert_eq!(n, 12);
    assert_eq!(small[8], b'.');

    // mutating the directory invalidates the saved cursor
    root.create(b"c", VnodeType::File).unwrap();
    let mut out = [0u8; 1024];
    assert_eq!(root.readdir(&mut cookie, &mut out).unwrap(), 0);
    assert_eq!(root.readdir(&mut cookie, &mut out).unwrap(), 0);

    // a fresh cursor sees all five entries
    let entries = read_entries(&root);
    assert_eq!(entries.len(), 5);
}

#[test]
fn readdir_resumes_mid_block() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    for name in [b"aa" as &[u8], b"bb", b"cc", b"dd"] {
        root.create(name, VnodeType::File).unwrap();
    }

    let mut cookie = DirCookie::new();
    let mut names = Vec::new();
    let mut out = [0u8; 24];
    loop {
        let n = root.readdir(&mut cookie, &mut out).unwrap();
        if n == 0 {
            break;
        }
        let mut pos = 0;
        while pos < n {
            let size = u32::from_le_bytes(out[pos..pos + 4].try_into().unwrap()) as usize;
            let name = &out[pos + 8..pos + size];
            let len = name.iter().position(|&b| b == 0).unwrap();
            names.push(String::from_utf8(name[..len].to_vec()).unwrap());
            pos += size;
        }
    }
    assert_eq!(names, vec![".", "..", "aa", "bb", "cc", "dd"]);
}

#[test]
fn file_vnodes_reject_directory_ops() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let f = root.create(b"plain", VnodeType::File).unwrap();

    assert_eq!(f.lookup(b"x").unwrap_err(), FsError::NotSupported);
    assert_eq!(
        f.create(b"x", VnodeType::File).unwrap_err(),
        FsError::NotSupported
    );
    assert_eq!(f.unlink(b"x").unwrap_err(), FsError::NotSupported);
    let mut cookie = DirCookie::new();
    let mut out = [0u8; 64];
    assert_eq!(
        f.readdir(&mut cookie, &mut out).unwrap_err(),
        FsError::NotSupported
    );
}

#[test]
fn vnode_ops_dispatch() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root: Rc<dyn VnodeOps> = fs.root().unwrap();

    root.open(0).unwrap();
    let child = root.create(b"via-trait", VnodeType::File).unwrap();
    assert_eq!(child.write(b"abc", 0).unwrap(), 3);
    let mut buf = [0u8; 3];
    assert_eq!(child.read(&mut buf, 0).unwrap(), 3);
    assert_eq!(&buf, b"abc");
    assert_eq!(child.getattr().unwrap().size, 3);
    assert_eq!(
        child.ioctl(1, &[], &mut []).unwrap_err(),
        FsError::NotSupported
    );
    let again = root.lookup(b"via-trait").unwrap();
    assert_eq!(again.getattr().unwrap().ino, child.getattr().unwrap().ino);
    root.unlink(b"via-trait").unwrap();
    child.release();
    root.close().unwrap();
}

#[test]
fn bad_names_are_rejected() {
    let disk = format(1024);
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    assert_eq!(root.lookup(b"").unwrap_err(), FsError::InvalidArgs);
    assert_eq!(
        root.create(b"a/b", VnodeType::File).unwrap_err(),
        FsError::InvalidArgs
    );
    let long = vec![b'x'; 300];
    assert_eq!(root.create(&long, VnodeType::File).unwrap_err(), FsError::InvalidArgs);
}
