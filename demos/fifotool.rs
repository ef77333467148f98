use anyhow::{bail, Context};
use clap::Parser;
use norfifo::low_level::{self, ChunkClass, Flash};
use norfifo::{FileId, FileSet, PAGES_PER_FILE};
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Parser)]
struct Fifotool {
    /// Page (erase unit) size of the emulated flash device.
    #[clap(short, long, default_value_t = 128)]
    page_size: u32,

    image_file: std::path::PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Create an image file with every byte erased.
    Init,
    /// Append one record.
    Push {
        #[clap(arg_enum)]
        file: ArgFile,
        data: String,
    },
    /// Read up to `n` payload bytes without consuming them.
    Peek {
        #[clap(arg_enum)]
        file: ArgFile,
        n: usize,
    },
    /// Read and consume up to `n` payload bytes.
    Pop {
        #[clap(arg_enum)]
        file: ArgFile,
        n: usize,
    },
    /// Report occupied bytes.
    Size {
        #[clap(arg_enum)]
        file: ArgFile,
    },
    /// Hex-dump a file's pages and walk its chunk stream.
    Dump {
        #[clap(arg_enum)]
        file: ArgFile,
    },
}

#[derive(Copy, Clone, Debug, clap::ArgEnum)]
enum ArgFile {
    RootBlock,
    Firmware,
    DriveLog,
    DebugLog,
    Prefs,
    Alive,
    Scratch,
    CrashLog,
}

impl From<ArgFile> for FileId {
    fn from(a: ArgFile) -> Self {
        match a {
            ArgFile::RootBlock => Self::RootBlock,
            ArgFile::Firmware => Self::Firmware,
            ArgFile::DriveLog => Self::DriveLog,
            ArgFile::DebugLog => Self::DebugLog,
            ArgFile::Prefs => Self::Prefs,
            ArgFile::Alive => Self::Alive,
            ArgFile::Scratch => Self::Scratch,
            ArgFile::CrashLog => Self::CrashLog,
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Fifotool::parse();

    if matches!(args.cmd, Cmd::Init) {
        let len = FileId::ALL.len() as u32 * PAGES_PER_FILE * args.page_size;
        let mut f = std::fs::File::create(&args.image_file)
            .with_context(|| format!("creating {}", args.image_file.display()))?;
        f.write_all(&vec![0xFF; len as usize])?;
        println!(
            "initialized {} files x {} pages x {} bytes",
            FileId::ALL.len(),
            PAGES_PER_FILE,
            args.page_size
        );
        return Ok(());
    }

    let img = FlashImage::open(&args.image_file, args.page_size).with_context(|| {
        format!("opening image file {}", args.image_file.display())
    })?;

    match args.cmd {
        Cmd::Init => unreachable!(),
        Cmd::Push { file, data } => {
            with_open_file(img, file.into(), |set, handle| {
                let n = set.write(handle, data.as_bytes())?;
                if n == 0 {
                    println!("rejected (record too large, no space, or page awaiting erase)");
                } else {
                    println!("wrote {n} bytes");
                }
                Ok(())
            })?;
        }
        Cmd::Peek { file, n } => {
            with_open_file(img, file.into(), |set, handle| {
                let mut out = vec![0; n];
                let got = set.read(handle, &mut out)?;
                println!("{}", pretty_hex::pretty_hex(&&out[..got]));
                Ok(())
            })?;
        }
        Cmd::Pop { file, n } => {
            with_open_file(img, file.into(), |set, handle| {
                let mut out = vec![0; n];
                let got = set.read(handle, &mut out)?;
                let consumed = set.consume(handle, got)?;
                println!("{}", pretty_hex::pretty_hex(&&out[..got]));
                println!("consumed {consumed} of {got} bytes read");
                Ok(())
            })?;
        }
        Cmd::Size { file } => {
            with_open_file(img, file.into(), |set, handle| {
                println!("{} bytes in use", set.size(handle));
                Ok(())
            })?;
        }
        Cmd::Dump { file } => {
            dump(&img, file.into())?;
        }
    }

    Ok(())
}

fn with_open_file(
    img: FlashImage,
    id: FileId,
    body: impl FnOnce(&mut FileSet<FlashImage>, &mut norfifo::FileHandle) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut set = FileSet::new(img);
    let mut handle = match set.open(id) {
        Ok(h) => h,
        Err(e) => bail!("could not open {:?}: {:?}", id, e),
    };
    let r = body(&mut set, &mut handle);
    set.close(handle);
    r
}

fn dump(img: &FlashImage, id: FileId) -> anyhow::Result<()> {
    let page_size = img.page_size();
    let region = low_level::Region::new(
        id as u32 * PAGES_PER_FILE * page_size,
        page_size,
        PAGES_PER_FILE,
    );

    for page in 0..PAGES_PER_FILE {
        let page_start = page * page_size;
        let mut bytes = vec![0; page_size as usize];
        img.read(region.base + page_start, &mut bytes)?;

        let counter = bytes[0];
        println!(
            "page {page}: counter {counter:#04x}{}",
            if !low_level::counter_is_legal(counter) {
                " (ILLEGAL -- interrupted erase?)"
            } else if counter == 0xFF {
                " (erased)"
            } else {
                ""
            },
        );
        println!("{}", pretty_hex::pretty_hex(&bytes));

        if counter == 0xFF {
            continue;
        }
        let mut pos = 1usize;
        while pos + 1 < page_size as usize {
            let (size, state) = (bytes[pos], bytes[pos + 1]);
            let class = low_level::classify(size, state);
            match class {
                ChunkClass::Erased => break,
                ChunkClass::Corrupt => {
                    println!("  {pos:#06x}: corrupt pair ({size:#04x}, {state:#04x})");
                    break;
                }
                _ => {
                    println!("  {:#06x}: {:?}, {} payload bytes", pos, class, size);
                    pos += size as usize + 2;
                }
            }
        }
        println!();
    }
    Ok(())
}

struct FlashImage {
    file: RefCell<std::fs::File>,
    page_size: u32,
}

impl FlashImage {
    fn open(
        path: impl AsRef<std::path::Path>,
        page_size: u32,
    ) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if file_len % u64::from(page_size) != 0 {
            bail!("file is not a whole number of pages in length");
        }
        let needed = u64::from(FileId::ALL.len() as u32 * PAGES_PER_FILE * page_size);
        if file_len < needed {
            bail!("file too small: need {needed} bytes for all files");
        }

        Ok(Self { file: file.into(), page_size })
    }
}

impl Flash for FlashImage {
    type Error = std::io::Error;

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read(&self, addr: u32, out: &mut [u8]) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.read_exact(out)
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        // NOR semantics: programming can only clear bits.
        let mut current = vec![0; data.len()];
        self.read(addr, &mut current)?;
        for (c, d) in current.iter_mut().zip(data) {
            *c &= d;
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(&current)
    }

    fn erase_page(&mut self, addr: u32) -> Result<(), Self::Error> {
        let erased = vec![0xFF; self.page_size as usize];
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(&erased)
    }
}
