use poolfs::alloc::DriveAllocator;
use poolfs::drive::localdir::LocalDirDrive;
use poolfs::fuse::mount::mount_unprivileged;
use poolfs::vfs::fs::FilesystemRoot;
use poolfs::vfs::node::DirManifest;
use std::sync::Arc;

#[cfg(target_os = "linux")]
const DEFAULT_QUOTA_BYTES: u64 = 1 << 30; // 1 GiB per drive

#[cfg(target_os = "linux")]
fn usage() -> ! {
    eprintln!(
        "Usage: poolfs <drive_dir>... <mount_point>\n\n  drive_dir: backing directory for one drive, registered in argument order\n             (created if missing; quota per drive via POOLFS_DRIVE_QUOTA bytes)\n  mount_point: empty directory to mount poolfs\n\nExample:\n  poolfs /tmp/poolfs-a /tmp/poolfs-b /tmp/poolfs-mnt"
    );
    std::process::exit(2);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    #[cfg(not(target_os = "linux"))]
    {
        eprintln!(
            "This mount binary only works on Linux (FUSE).\nIf you're on Windows, please run under WSL/WSL2 or a Linux host."
        );
        std::process::exit(2);
    }

    #[cfg(target_os = "linux")]
    {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.len() < 2 {
            usage();
        }
        let (drive_dirs, mount_point) = args.split_at(args.len() - 1);
        let mount_point = &mount_point[0];

        let quota = std::env::var("POOLFS_DRIVE_QUOTA")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_QUOTA_BYTES);

        let allocator = Arc::new(DriveAllocator::new());
        for dir in drive_dirs {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("create drive dir {dir} failed: {e}");
                std::process::exit(1);
            }
            allocator.register_drive(Arc::new(LocalDirDrive::new(dir, quota)));
        }
        let fs = FilesystemRoot::new(allocator, DirManifest::new());

        if let Err(e) = std::fs::create_dir_all(mount_point) {
            eprintln!("create mount point failed: {e}");
            std::process::exit(1);
        }

        println!(
            "Mounting poolfs at {} ({} drive(s), {} bytes quota each)...",
            mount_point,
            drive_dirs.len(),
            quota
        );
        println!("Press Ctrl+C to unmount and exit.");
        let handle = match mount_unprivileged(fs, std::path::Path::new(mount_point)).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!(
                    "mount failed: {e}\n\nHint: ensure you are on Linux with FUSE (fusermount3) available."
                );
                std::process::exit(1);
            }
        };

        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("signal error: {e}");
        }

        println!("Unmounting...");
        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
