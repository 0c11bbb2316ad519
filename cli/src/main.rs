use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use xfstx::item::ItemPayload;
use xfstx::wal::format::{decode_commit, decode_start};
use xfstx::{
    mkfs, BlockDevice, FileDevice, LogReader, MetadataOps, Mount, RecordRead, RecordType,
    SetAttr, TransClass, TransReservations, XfsOps, ROOT_INO,
};
use xfstx_core::{MountConfig, XfsError};

#[derive(Parser)]
#[command(name = "xfstx")]
#[command(about = "Transactional metadata engine over image files", long_about = None)]
struct Cli {
    /// JSON geometry file; defaults are used for missing fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Images {
    /// Data device image
    #[arg(long)]
    data: PathBuf,
    /// Log device image
    #[arg(long)]
    log: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Create both images and format them
    Mkfs {
        #[command(flatten)]
        images: Images,
    },
    /// Print the live part of the log, tail to head
    Logprint {
        #[command(flatten)]
        images: Images,
        /// Hex dump every payload
        #[arg(long)]
        raw: bool,
    },
    /// Mount (replaying the log if needed), report, and unmount cleanly
    Recover {
        #[command(flatten)]
        images: Images,
    },
    /// Print the per-class reservation table for the geometry
    Reservations,
    /// Run a random concurrent namespace workload
    Stress {
        #[command(flatten)]
        images: Images,
        #[arg(short, long, default_value_t = 4)]
        threads: u64,
        #[arg(short, long, default_value_t = 1000)]
        ops: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Stop without unmounting, leaving the log to be recovered
        #[arg(long)]
        crash: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MountConfig> {
    let config = match path {
        Some(path) => MountConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MountConfig::default(),
    };
    Ok(config)
}

fn open_images(
    config: &MountConfig,
    images: &Images,
) -> anyhow::Result<(Arc<dyn BlockDevice>, Arc<dyn BlockDevice>)> {
    let data = FileDevice::open(&images.data, config.block_size as usize)
        .with_context(|| format!("opening {}", images.data.display()))?;
    let log = FileDevice::open(&images.log, config.log_block_size as usize)
        .with_context(|| format!("opening {}", images.log.display()))?;
    Ok((Arc::new(data), Arc::new(log)))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Mkfs { images } => {
            let data = FileDevice::create(&images.data, config.block_size as usize, config.data_blocks)
                .with_context(|| format!("creating {}", images.data.display()))?;
            let log = FileDevice::create(
                &images.log,
                config.log_block_size as usize,
                config.log_blocks as u64,
            )
            .with_context(|| format!("creating {}", images.log.display()))?;
            let uuid = mkfs(&config, Arc::new(data), Arc::new(log))?;
            println!("Formatted {} ({} blocks of {} bytes)", uuid, config.data_blocks, config.block_size);
            println!("  Inodes: {}", config.inode_count);
            println!("  Log: {} blocks of {} bytes", config.log_blocks, config.log_block_size);
        }
        Commands::Logprint { images, raw } => {
            let (_, log) = open_images(&config, &images)?;
            logprint(LogReader::new(log, config.log_blocks, None), raw)?;
        }
        Commands::Recover { images } => {
            let (data, log) = open_images(&config, &images)?;
            let mount = Mount::mount(config, data, log)?;
            println!("{}", serde_json::to_string_pretty(mount.recovery_stats())?);
            mount.unmount()?;
        }
        Commands::Reservations => {
            let table = TransReservations::compute(&config);
            println!("{:<12} {:>10} {:>6} {:>12}", "class", "bytes", "count", "permanent");
            for entry in table.entries() {
                println!(
                    "{:<12} {:>10} {:>6} {:>12}",
                    entry.class.to_string(),
                    entry.bytes,
                    entry.log_count,
                    entry.bytes * entry.log_count as u64
                );
            }
            match table.check_fits(config.log_bytes()) {
                Ok(()) => println!("\nLargest permanent reservation fits the {} byte log", config.log_bytes()),
                Err(e) => println!("\n{}", e),
            }
        }
        Commands::Stress {
            images,
            threads,
            ops,
            seed,
            crash,
        } => {
            let (data, log) = open_images(&config, &images)?;
            let mount = Mount::mount(config, data, log)?;
            let fs = Arc::new(XfsOps::new(Arc::clone(&mount)));
            stress(&fs, threads, ops, seed)?;
            println!("{}", serde_json::to_string_pretty(&mount.stats())?);
            if crash {
                log::warn!("Leaving the filesystem without an unmount record");
                mount.shutdown("crash requested");
            } else {
                mount.unmount()?;
            }
        }
    }

    Ok(())
}

fn logprint(reader: LogReader, raw: bool) -> anyhow::Result<()> {
    let head = reader.find_head()?;
    let start = match reader.last_record_before(head)? {
        Some(last) => last.header.tail_lsn,
        None => head,
    };
    println!("Log tail {} head {}", start, head);

    let mut pos = start;
    while pos < head {
        let record = match reader.read_record(pos)? {
            RecordRead::Valid(record) => record,
            RecordRead::Invalid(reason) => {
                println!("{:>10}  invalid: {}", pos.to_string(), reason);
                break;
            }
        };
        let header = &record.header;
        let detail = match header.rtype {
            RecordType::Start => match decode_start(&record.payload) {
                Ok((class, reservation)) => format!(
                    "{} reserved {}",
                    TransClass::from_u8(class).map_or_else(|| format!("class {}", class), |c| c.to_string()),
                    reservation
                ),
                Err(e) => e.to_string(),
            },
            RecordType::Item => match ItemPayload::decode(&record.payload) {
                Ok(item) => item.describe(),
                Err(e) => e.to_string(),
            },
            RecordType::Commit => match decode_commit(&record.payload) {
                Ok((count, crc)) => format!("{} items crc {:08x}", count, crc),
                Err(e) => e.to_string(),
            },
            RecordType::Unmount => String::new(),
        };
        println!(
            "{:>10}  tid {:<6} {:<8} tail {:<10} {}",
            pos.to_string(),
            header.tid,
            header.rtype.name(),
            header.tail_lsn.to_string(),
            detail
        );
        if raw && !record.payload.is_empty() {
            for chunk in record.payload.chunks(32) {
                println!("            {}", hex::encode(chunk));
            }
        }
        pos = record.end(reader.log_blocks());
    }
    Ok(())
}

fn stress(fs: &Arc<XfsOps>, threads: u64, ops: usize, seed: u64) -> anyhow::Result<()> {
    let mut dirs = Vec::new();
    for i in 0..threads {
        let name = format!("stress{}", i);
        let dir = match fs.lookup(ROOT_INO, &name) {
            Ok(ino) => ino,
            Err(XfsError::NotFound(_)) => fs.mkdir(ROOT_INO, &name, 0o755)?,
            Err(e) => return Err(e.into()),
        };
        dirs.push(dir);
    }

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let fs = Arc::clone(fs);
            let dirs = dirs.clone();
            thread::spawn(move || worker(&fs, &dirs, ops, seed.wrapping_add(t)))
        })
        .collect();
    for handle in workers {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("stress worker panicked"))??;
    }
    Ok(())
}

fn worker(fs: &XfsOps, dirs: &[u64], ops: usize, seed: u64) -> Result<(), XfsError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let pick = |rng: &mut StdRng| (dirs[rng.gen_range(0..dirs.len())], format!("f{}", rng.gen_range(0..16)));

    for _ in 0..ops {
        let (dir, name) = pick(&mut rng);
        let result = match rng.gen_range(0..6) {
            0 => fs.create(dir, &name, 0o644).map(|_| ()),
            1 => fs.unlink(dir, &name),
            2 => {
                let (to_dir, to_name) = pick(&mut rng);
                fs.lookup(dir, &name).and_then(|ino| fs.link(ino, to_dir, &to_name))
            }
            3 => {
                let (to_dir, to_name) = pick(&mut rng);
                fs.rename(dir, &name, to_dir, &to_name)
            }
            4 => {
                let attr = SetAttr {
                    uid: Some(rng.gen_range(0..1000)),
                    ..Default::default()
                };
                fs.lookup(dir, &name).and_then(|ino| fs.setattr(ino, &attr))
            }
            _ => {
                let size = rng.gen_range(0..=fs.mount().config().block_size as u64);
                fs.lookup(dir, &name).and_then(|ino| fs.truncate(ino, size))
            }
        };
        match result {
            Ok(())
            | Err(XfsError::NotFound(_))
            | Err(XfsError::Exists(_))
            | Err(XfsError::NoSpace(_))
            | Err(XfsError::InvalidInput(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
