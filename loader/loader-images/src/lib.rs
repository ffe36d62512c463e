//! # Image Graph Builder
//!
//! Loads the kernel, the HAL, the boot drivers and every transitively
//! imported DLL; assigns their kernel-range addresses; orders, packs and
//! links them.
//!
//! The build is a worklist over [`ImageRecord`]s: each loaded image's
//! imports are redirected through the API-set schema, matched against the
//! records already present, and appended as new records otherwise (with an
//! order value one below their importer, clamped at zero). Once the list is
//! closed the records are re-sorted (kernel, HAL, then descending order so
//! the deepest dependencies come last), packed into one 4 MiB-aligned
//! physical region, and every IAT slot is resolved against the in-memory
//! export sets, following forwarder chains across images.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use loader_apiset::{ApiSetSchema, is_api_set_name};
use loader_options::CommandLine;
use loader_pe::{PeError, PeImage};
use loader_vmem::{MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr, VaCursor, VirtAddr, align_up};
use log::{info, warn};

/// x86 large-page granule the packed image region must respect.
const IMAGE_REGION_ALIGN: u64 = 0x40_0000;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("failed to load {0}: {1}")]
    Load(String, PeError),
    #[error("unresolved import {1} in {0}")]
    UnresolvedImport(String, String),
    #[error("out of pages for the image region")]
    OutOfMemory,
    #[error("image list is empty")]
    Empty,
}

/// File access for image loading. `read` walks `dir` below the Windows
/// directory; implementations retry case-insensitively.
pub trait ImageSource {
    /// Read a file; `Ok(None)` when it does not exist (so the caller can
    /// distinguish fallback from failure).
    fn read(&mut self, dir: &str, name: &str) -> Result<Option<Vec<u8>>, ImageError>;
}

/// Load/link lifecycle of one record. Transitions are monotonic; any
/// failure aborts the boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ImageState {
    Registered,
    Loaded,
    Relocated,
    ImportsResolved,
    MovedContiguous,
}

/// One entry of the global image list.
pub struct ImageRecord {
    /// Base name, e.g. `ntoskrnl.exe`.
    pub name: String,
    /// Directory relative to the Windows directory, e.g. `system32`.
    pub dir: String,
    pub memory_kind: MemoryKind,
    pub is_dll: bool,
    /// Boot-driver list entry to back-link from the loader entry.
    pub bdle: Option<PhysAddr>,
    /// Topological-ish order: drivers count up, dependencies inherit
    /// `parent - 1` (clamped at zero).
    pub order: u32,
    /// Kernel, HAL, and anything they transitively import must not be
    /// rebased by the kernel.
    pub no_reloc: bool,
    pub state: ImageState,
    pub va: VirtAddr,
    pub image: Option<PeImage>,
    /// Import names as found in the descriptor table (pre-redirection).
    pub imports: Vec<String>,
}

impl ImageRecord {
    #[must_use]
    pub fn pe(&self) -> &PeImage {
        self.image.as_ref().expect("image is loaded")
    }

    /// Name without its extension, the unit of import matching.
    #[must_use]
    pub fn stem(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }
}

fn stem_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Which kernel image an x86 boot prefers. PAE kernels (`ntkrnlpa.exe`)
/// are used whenever PAE is usable and the CPU's NX support is not forced
/// off; an explicit `KERNEL=` override always wins.
#[must_use]
pub fn preferred_x86_kernel(
    pae_supported: bool,
    nx_supported: bool,
    cmdline: &CommandLine,
) -> &'static str {
    use loader_options::{NxPolicy, PaePolicy};

    let nx_usable = nx_supported && cmdline.nx != NxPolicy::AlwaysOff;
    let try_pae =
        pae_supported && (nx_usable || cmdline.pae == PaePolicy::ForceEnable);

    if try_pae && cmdline.kernel.is_none() {
        "ntkrnlpa.exe"
    } else {
        "ntoskrnl.exe"
    }
}

/// The image list plus the monotonic placement cursor.
pub struct ImageGraph {
    images: Vec<ImageRecord>,
    cursor: VaCursor,
    /// Index of a substituted KDNET stub, for the debugger init path.
    kd_stub: Option<usize>,
}

impl ImageGraph {
    #[must_use]
    pub fn new(image_base: u64) -> Self {
        Self {
            images: Vec::new(),
            cursor: VaCursor::new(image_base),
            kd_stub: None,
        }
    }

    /// Append a record (`Registered` state).
    pub fn add(
        &mut self,
        name: &str,
        kind: MemoryKind,
        dir: &str,
        is_dll: bool,
        bdle: Option<PhysAddr>,
        order: u32,
        no_reloc: bool,
    ) {
        self.images.push(ImageRecord {
            name: String::from(name),
            dir: String::from(dir),
            memory_kind: kind,
            is_dll,
            bdle,
            order,
            no_reloc,
            state: ImageState::Registered,
            va: VirtAddr::new(0),
            image: None,
            imports: Vec::new(),
        });
    }

    #[must_use]
    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    #[must_use]
    pub fn images_mut(&mut self) -> &mut [ImageRecord] {
        &mut self.images
    }

    #[must_use]
    pub fn kd_stub(&self) -> Option<&ImageRecord> {
        self.kd_stub.map(|i| &self.images[i])
    }

    #[must_use]
    pub fn kd_stub_mut(&mut self) -> Option<&mut ImageRecord> {
        let index = self.kd_stub?;
        Some(&mut self.images[index])
    }

    /// Virtual address the cursor will hand out next.
    #[must_use]
    pub fn next_va(&self) -> VirtAddr {
        self.cursor.current()
    }

    /// Round the cursor up (large-page shunt after packing).
    pub fn align_cursor(&mut self, align: u64) {
        self.cursor.align_to(align);
    }

    fn open_image_file(
        &mut self,
        index: usize,
        source: &mut dyn ImageSource,
        cmdline: &CommandLine,
    ) -> Result<(Vec<u8>, bool), ImageError> {
        let name = self.images[index].name.clone();
        let dir = self.images[index].dir.clone();

        // Transport substitution: a non-serial debugger replaces kdcom.
        if name.eq_ignore_ascii_case("kdcom.dll")
            && let Some(transport) = cmdline.debug_type.as_deref()
            && transport != "com"
        {
            let substitute = format!("kd{transport}.dll");
            if let Some(data) = source.read(&dir, &substitute)? {
                info!("opening {substitute} instead of {name}");
                self.kd_stub = Some(index);
                return Ok((data, transport == "net"));
            }
            warn!("could not find {substitute}, opening {name}");
        }

        // HAL= and KERNEL= overrides, falling back to the standard file.
        let override_name = if name.eq_ignore_ascii_case("hal.dll") {
            cmdline.hal.as_deref()
        } else if name.eq_ignore_ascii_case("ntoskrnl.exe") {
            cmdline.kernel.as_deref()
        } else {
            None
        };

        if let Some(override_name) = override_name {
            if let Some(data) = source.read(&dir, override_name)? {
                info!("opening {override_name} as {name}");
                return Ok((data, false));
            }
            warn!("could not find {override_name}, opening {name}");
        }

        if let Some(data) = source.read(&dir, &name)? {
            return Ok((data, false));
        }

        // Boot drivers occasionally name a directory that does not exist on
        // disk; the drivers directory is the fallback.
        if !dir.eq_ignore_ascii_case("system32\\drivers")
            && let Some(data) = source.read("system32\\drivers", &name)?
        {
            return Ok((data, false));
        }

        Err(ImageError::NotFound(name))
    }

    /// Redirect one import through the schema when applicable.
    fn redirect<'a>(apiset: Option<&'a ApiSetSchema>, name: &'a str) -> Option<String> {
        if !is_api_set_name(name) {
            return None;
        }
        apiset?.resolve(name)
    }

    /// Drive the worklist: load every registered image, expand its imports,
    /// and keep going until the list closes over its dependencies.
    pub fn load_all(
        &mut self,
        source: &mut dyn ImageSource,
        apiset: Option<&ApiSetSchema>,
        cmdline: &CommandLine,
        alloc: &mut dyn PageAllocator,
        cookie_seed: u32,
    ) -> Result<(), ImageError> {
        let mut index = 0;
        while index < self.images.len() {
            if self.images[index].image.is_none() {
                let (data, defer_reloc) = self.open_image_file(index, source, cmdline)?;

                let va = self.cursor.current();
                // The KDNET stub is relocated only after its hardware
                // context is allocated.
                let intended = (!defer_reloc).then_some(va.as_u64());
                let image = PeImage::load(&data, intended, alloc, cookie_seed)
                    .map_err(|e| ImageError::Load(self.images[index].name.clone(), e))?;

                self.cursor.take(image.page_span());
                info!("loaded {} at {va}", self.images[index].name);

                let imports = image
                    .list_imports()
                    .map_err(|e| ImageError::Load(self.images[index].name.clone(), e))?;

                let record = &mut self.images[index];
                record.va = va;
                record.image = Some(image);
                record.imports = imports;
                record.state = if defer_reloc {
                    ImageState::Loaded
                } else {
                    ImageState::Relocated
                };
            }

            self.expand_imports(index, apiset);
            index += 1;
        }

        if self.images.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(())
    }

    /// Match one image's imports against the list, appending new records.
    fn expand_imports(&mut self, index: usize, apiset: Option<&ApiSetSchema>) {
        // The kernel and the HAL pin everything they reach.
        let no_reloc = index < 2 || self.images[index].no_reloc;
        let order = self.images[index].order;
        let child_order = order.saturating_sub(1);
        let dir = self.images[index].dir.clone();
        let imports = self.images[index].imports.clone();

        for import in &imports {
            let resolved = Self::redirect(apiset, import);
            let name = resolved.as_deref().unwrap_or(import);
            if let Some(resolved) = &resolved {
                info!("using {resolved} instead of {import}");
            }

            match self
                .images
                .iter_mut()
                .find(|i| i.name.eq_ignore_ascii_case(name))
            {
                Some(existing) => {
                    if no_reloc {
                        existing.no_reloc = true;
                    }
                    if existing.order >= order {
                        existing.order = child_order;
                    }
                }
                None => {
                    self.add(
                        name,
                        MemoryKind::SystemCode,
                        &dir,
                        true,
                        None,
                        child_order,
                        no_reloc,
                    );
                }
            }
        }
    }

    /// Re-sort: kernel first, HAL second, then stable by descending order
    /// value so the deepest dependencies come last.
    pub fn sort(&mut self) {
        if self.images.len() < 2 {
            return;
        }

        // Remember the stub by identity, not index.
        let kd_name = self.kd_stub.map(|i| self.images[i].name.clone());

        let mut rest = self.images.split_off(2);
        rest.sort_by_key(|record| core::cmp::Reverse(record.order));
        self.images.append(&mut rest);

        if let Some(kd_name) = kd_name {
            self.kd_stub = self.images.iter().position(|i| i.name == kd_name);
        }
    }

    /// Pack every image into one physically contiguous region aligned to
    /// the x86 large-page granule.
    pub fn make_contiguous(&mut self, alloc: &mut dyn PageAllocator) -> Result<(), ImageError> {
        let mut total = 0u64;
        for record in &self.images {
            total += record.pe().page_span() * PAGE_SIZE;
        }
        total = align_up(total, IMAGE_REGION_ALIGN);

        // Over-allocate so the base can be pushed up to the next granule.
        let pages = (total + IMAGE_REGION_ALIGN - PAGE_SIZE) / PAGE_SIZE;
        let region = alloc.alloc_pages(pages).ok_or(ImageError::OutOfMemory)?;
        let mut at = PhysAddr::new(align_up(region.as_u64(), IMAGE_REGION_ALIGN));

        for record in &mut self.images {
            let image = record.image.as_mut().expect("image is loaded");
            image.move_to(at, alloc);
            at = at.add(image.page_span() * PAGE_SIZE);
            record.state = ImageState::MovedContiguous;
        }

        Ok(())
    }

    /// Resolve every IAT entry using the in-memory export sets, following
    /// forwarder chains across images.
    pub fn resolve_imports(&mut self, apiset: Option<&ApiSetSchema>) -> Result<(), ImageError> {
        for index in 0..self.images.len() {
            let imports = self.images[index].imports.clone();
            if imports.is_empty() {
                continue;
            }

            let (left, rest) = self.images.split_at_mut(index);
            let (current, right) = rest.split_first_mut().expect("index is in range");

            // The export universe for this image: every other record.
            let universe: Vec<(&str, &PeImage)> = left
                .iter()
                .chain(right.iter())
                .filter_map(|record| {
                    record.image.as_ref().map(|pe| (record.name.as_str(), pe))
                })
                .collect();

            for import in &imports {
                let resolved = Self::redirect(apiset, import);
                let target_name = resolved.as_deref().unwrap_or(import);

                let Some((_, library)) = universe
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(target_name))
                else {
                    return Err(ImageError::UnresolvedImport(
                        current.name.clone(),
                        String::from(target_name),
                    ));
                };

                let current_image = current.image.as_mut().expect("image is loaded");
                current_image
                    .resolve_imports(import, library, &mut |forward| {
                        lookup_forward(&universe, forward)
                    })
                    .map_err(|e| ImageError::Load(current.name.clone(), e))?;
            }

            self.images[index].state = ImageState::ImportsResolved;
        }

        Ok(())
    }
}

/// Resolve a forwarder string `dll.function` against the export universe,
/// chasing chained forwarders.
fn lookup_forward(universe: &[(&str, &PeImage)], target: &str) -> Option<u64> {
    let (dll, function) = target.split_once('.')?;

    let (_, library) = universe
        .iter()
        .find(|(name, _)| stem_of(name).eq_ignore_ascii_case(dll))?;

    library
        .find_export(function, &mut |next| lookup_forward(universe, next))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    struct TestAlloc;

    #[repr(C, align(4096))]
    struct PageBlock([u8; 4096]);

    impl PageAllocator for TestAlloc {
        fn alloc_pages(&mut self, pages: u64) -> Option<PhysAddr> {
            let blocks: Vec<PageBlock> = (0..pages).map(|_| PageBlock([0; 4096])).collect();
            let leaked = Box::leak(blocks.into_boxed_slice());
            Some(PhysAddr::new(leaked.as_mut_ptr() as u64))
        }

        fn free_pages(&mut self, _base: PhysAddr, _pages: u64) {}
    }

    /// In-memory file tree.
    struct TestSource {
        files: Vec<(String, Vec<u8>)>,
    }

    impl ImageSource for TestSource {
        fn read(&mut self, dir: &str, name: &str) -> Result<Option<Vec<u8>>, ImageError> {
            let path = format!("{dir}\\{name}");
            Ok(self
                .files
                .iter()
                .find(|(p, _)| p.eq_ignore_ascii_case(&path))
                .map(|(_, d)| d.clone()))
        }
    }

    fn put16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_str(buf: &mut [u8], offset: usize, value: &str) {
        buf[offset..offset + value.len()].copy_from_slice(value.as_bytes());
    }

    /// Minimal PE32+ with one `.rdata` section at RVA 0x1000 (file 0x200)
    /// and no relocations (rebasing is then a pure base switch).
    fn minimal_pe(imports: &[&str], exports: &[&str]) -> Vec<u8> {
        let mut buf = vec![0u8; 0xc00];
        put16(&mut buf, 0, 0x5a4d);
        put32(&mut buf, 0x3c, 0x80);
        put32(&mut buf, 0x80, 0x0000_4550);
        put16(&mut buf, 0x84, 0x8664);
        put16(&mut buf, 0x86, 1); // one section
        put16(&mut buf, 0x94, 240);
        put16(&mut buf, 0x96, 0x2022);

        let opt = 0x98;
        put16(&mut buf, opt, 0x20b);
        put32(&mut buf, opt + 16, 0x1000); // entry
        put64(&mut buf, opt + 24, 0x1_8000_0000); // image base
        put32(&mut buf, opt + 32, 0x1000);
        put32(&mut buf, opt + 36, 0x200);
        put32(&mut buf, opt + 56, 0x2000); // size of image
        put32(&mut buf, opt + 60, 0x200); // size of headers
        put32(&mut buf, opt + 92, 16);

        let section = 0x188;
        put_str(&mut buf, section, ".rdata");
        put32(&mut buf, section + 8, 0x1000); // vsize
        put32(&mut buf, section + 12, 0x1000); // va
        put32(&mut buf, section + 16, 0xa00); // raw size
        put32(&mut buf, section + 20, 0x200); // raw
        put32(&mut buf, section + 36, 0x4000_0040);

        let file = |rva: usize| rva - 0x1000 + 0x200;

        if !imports.is_empty() {
            // Descriptors at 0x1000, strings from 0x1100, thunks from 0x1300.
            let dirs = opt + 112;
            put32(&mut buf, dirs + 8, 0x1000);
            put32(&mut buf, dirs + 12, ((imports.len() + 1) * 20) as u32);

            let mut string_at = 0x1100;
            let mut thunk_at = 0x1300;
            for (i, import) in imports.iter().enumerate() {
                let descriptor = file(0x1000 + i * 20);
                put32(&mut buf, descriptor, thunk_at as u32); // ILT
                put32(&mut buf, descriptor + 12, string_at as u32); // name
                put32(&mut buf, descriptor + 16, (thunk_at + 0x80) as u32); // IAT
                put_str(&mut buf, file(string_at), import);
                string_at += import.len() + 1;

                // One by-name thunk per DLL: hint/name at string_at.
                put64(&mut buf, file(thunk_at), string_at as u64);
                put64(&mut buf, file(thunk_at + 0x80), string_at as u64);
                put_str(&mut buf, file(string_at) + 2, "Frobnicate");
                string_at += 2 + "Frobnicate".len() + 1;
                thunk_at += 0x100;
            }
        }

        if !exports.is_empty() {
            let dirs = opt + 112;
            put32(&mut buf, dirs, 0x1800);
            put32(&mut buf, dirs + 4, 0x200);

            let dir = file(0x1800);
            put32(&mut buf, dir + 16, 1); // ordinal base
            put32(&mut buf, dir + 20, exports.len() as u32);
            put32(&mut buf, dir + 24, exports.len() as u32);
            put32(&mut buf, dir + 28, 0x1900); // functions
            put32(&mut buf, dir + 32, 0x1940); // names
            put32(&mut buf, dir + 36, 0x1980); // ordinals

            let mut string_at = 0x19c0;
            for (i, export) in exports.iter().enumerate() {
                put32(&mut buf, file(0x1900 + i * 4), 0x1010 + i as u32 * 0x10);
                put32(&mut buf, file(0x1940 + i * 4), string_at as u32);
                put16(&mut buf, file(0x1980 + i * 2), i as u16);
                put_str(&mut buf, file(string_at), export);
                string_at += export.len() + 1;
            }
        }

        buf
    }

    fn graph_with_kernel_and_hal(source: &mut TestSource) -> ImageGraph {
        let mut graph = ImageGraph::new(0xffff_f808_0000_0000);
        graph.add("ntoskrnl.exe", MemoryKind::SystemCode, "system32", false, None, 0, false);
        graph.add("hal.dll", MemoryKind::HalCode, "system32", true, None, 0, false);

        let mut alloc = TestAlloc;
        graph
            .load_all(source, None, &CommandLine::default(), &mut alloc, 1)
            .unwrap();
        graph
    }

    fn basic_source() -> TestSource {
        TestSource {
            files: vec![
                (
                    String::from("system32\\ntoskrnl.exe"),
                    minimal_pe(&["hal.dll"], &["Frobnicate"]),
                ),
                (
                    String::from("system32\\hal.dll"),
                    minimal_pe(&[], &["Frobnicate"]),
                ),
            ],
        }
    }

    #[test]
    fn worklist_loads_seeds_and_assigns_monotonic_addresses() {
        let mut source = basic_source();
        let graph = graph_with_kernel_and_hal(&mut source);

        assert_eq!(graph.images().len(), 2);
        let kernel = &graph.images()[0];
        let hal = &graph.images()[1];
        assert_eq!(kernel.va.as_u64(), 0xffff_f808_0000_0000);
        assert_eq!(hal.va.as_u64(), kernel.va.as_u64() + 0x2000);
        assert_eq!(kernel.state, ImageState::Relocated);
    }

    #[test]
    fn missing_kernel_is_fatal() {
        let mut source = TestSource { files: vec![] };
        let mut graph = ImageGraph::new(0xffff_f808_0000_0000);
        graph.add("ntoskrnl.exe", MemoryKind::SystemCode, "system32", false, None, 0, false);

        let mut alloc = TestAlloc;
        assert!(matches!(
            graph.load_all(&mut source, None, &CommandLine::default(), &mut alloc, 1),
            Err(ImageError::NotFound(_))
        ));
    }

    #[test]
    fn drivers_directory_is_the_fallback() {
        let mut source = TestSource {
            files: vec![(
                String::from("system32\\drivers\\oddball.sys"),
                minimal_pe(&[], &[]),
            )],
        };
        let mut graph = ImageGraph::new(0xffff_f808_0000_0000);
        graph.add("oddball.sys", MemoryKind::SystemCode, "custom\\dir", false, None, 1, false);

        let mut alloc = TestAlloc;
        graph
            .load_all(&mut source, None, &CommandLine::default(), &mut alloc, 1)
            .unwrap();
        assert!(graph.images()[0].image.is_some());
    }

    #[test]
    fn api_set_imports_are_replaced_and_deduplicated() {
        let schema_blob = {
            // v6 one-entry schema mapping the example set to krnl.dll.
            let mut buf = vec![0u8; 0x400];
            let name: Vec<u8> = "ext-ms-win-core-example-l1-1-0"
                .encode_utf16()
                .flat_map(u16::to_le_bytes)
                .collect();
            let host: Vec<u8> = "krnl.dll".encode_utf16().flat_map(u16::to_le_bytes).collect();
            put32(&mut buf, 12, 1);
            put32(&mut buf, 16, 0x40);
            put32(&mut buf, 0x40 + 4, 0x100);
            put32(&mut buf, 0x40 + 8, name.len() as u32);
            buf[0x100..0x100 + name.len()].copy_from_slice(&name);
            put32(&mut buf, 0x40 + 16, 0x200);
            put32(&mut buf, 0x40 + 20, 1);
            put32(&mut buf, 0x200 + 12, 0x300);
            put32(&mut buf, 0x200 + 16, host.len() as u32);
            buf[0x300..0x300 + host.len()].copy_from_slice(&host);
            buf
        };
        let schema = ApiSetSchema::new(schema_blob, loader_apiset::SchemaVersion::V6);

        let mut source = TestSource {
            files: vec![
                (
                    String::from("system32\\ntoskrnl.exe"),
                    minimal_pe(&["ext-ms-win-core-example-l1-1-0.dll"], &[]),
                ),
                (
                    String::from("system32\\hal.dll"),
                    minimal_pe(&[], &[]),
                ),
                (
                    String::from("system32\\krnl.dll"),
                    minimal_pe(&[], &["Frobnicate"]),
                ),
            ],
        };

        let mut graph = ImageGraph::new(0xffff_f808_0000_0000);
        graph.add("ntoskrnl.exe", MemoryKind::SystemCode, "system32", false, None, 0, false);
        graph.add("hal.dll", MemoryKind::HalCode, "system32", true, None, 0, false);

        let mut alloc = TestAlloc;
        graph
            .load_all(&mut source, Some(&schema), &CommandLine::default(), &mut alloc, 1)
            .unwrap();

        // The virtual DLL never becomes a record; the host appears once.
        assert!(!graph.images().iter().any(|i| i.name.starts_with("ext-ms")));
        assert_eq!(
            graph
                .images()
                .iter()
                .filter(|i| i.name.eq_ignore_ascii_case("krnl.dll"))
                .count(),
            1
        );

        // After resolution the kernel's IAT points into krnl.dll.
        graph.resolve_imports(Some(&schema)).unwrap();
        let krnl_va = graph
            .images()
            .iter()
            .find(|i| i.name == "krnl.dll")
            .unwrap()
            .va;
        let kernel = &graph.images()[0];
        let iat_slot = &kernel.pe().bytes()[0x1380..0x1388];
        let value = u64::from_le_bytes(iat_slot.try_into().unwrap());
        assert_eq!(value, krnl_va.as_u64() + 0x1010);
    }

    #[test]
    fn sort_keeps_kernel_and_hal_first_then_descending_order() {
        let mut source = TestSource {
            files: vec![
                (String::from("system32\\ntoskrnl.exe"), minimal_pe(&[], &[])),
                (String::from("system32\\hal.dll"), minimal_pe(&[], &[])),
                (
                    String::from("system32\\drivers\\fastfat.sys"),
                    minimal_pe(&["helper.dll"], &[]),
                ),
                (
                    String::from("system32\\drivers\\helper.dll"),
                    minimal_pe(&[], &["Frobnicate"]),
                ),
            ],
        };

        let mut graph = ImageGraph::new(0xffff_f808_0000_0000);
        graph.add("ntoskrnl.exe", MemoryKind::SystemCode, "system32", false, None, 0, false);
        graph.add("hal.dll", MemoryKind::HalCode, "system32", true, None, 0, false);
        graph.add(
            "fastfat.sys",
            MemoryKind::SystemCode,
            "system32\\drivers",
            false,
            None,
            1,
            false,
        );

        let mut alloc = TestAlloc;
        graph
            .load_all(&mut source, None, &CommandLine::default(), &mut alloc, 1)
            .unwrap();
        graph.sort();

        let names: Vec<_> = graph.images().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["ntoskrnl.exe", "hal.dll", "fastfat.sys", "helper.dll"]);
    }

    #[test]
    fn kernel_imports_pin_their_dependencies() {
        let mut source = basic_source();
        let graph = graph_with_kernel_and_hal(&mut source);

        // hal.dll is imported by the kernel, so it must not be rebased.
        assert!(graph.images()[1].no_reloc);
    }

    #[test]
    fn contiguous_packing_aligns_to_the_large_page_granule() {
        let mut source = basic_source();
        let mut graph = graph_with_kernel_and_hal(&mut source);

        let mut alloc = TestAlloc;
        graph.make_contiguous(&mut alloc).unwrap();

        let kernel = graph.images()[0].pe().address();
        assert_eq!(kernel.as_u64() % IMAGE_REGION_ALIGN, 0);

        let hal = graph.images()[1].pe().address();
        assert_eq!(hal.as_u64(), kernel.as_u64() + 0x2000);
        assert!(graph
            .images()
            .iter()
            .all(|i| i.state == ImageState::MovedContiguous));
    }

    #[test]
    fn pae_kernel_selection_follows_the_nx_policy() {
        use loader_options::{NxPolicy, PaePolicy};

        let plain = CommandLine::default();
        assert_eq!(preferred_x86_kernel(true, true, &plain), "ntkrnlpa.exe");
        assert_eq!(preferred_x86_kernel(false, true, &plain), "ntoskrnl.exe");

        // NX forced off drops PAE unless it is forced on itself.
        let mut nx_off = CommandLine::default();
        nx_off.nx = NxPolicy::AlwaysOff;
        assert_eq!(preferred_x86_kernel(true, true, &nx_off), "ntoskrnl.exe");
        nx_off.pae = PaePolicy::ForceEnable;
        assert_eq!(preferred_x86_kernel(true, true, &nx_off), "ntkrnlpa.exe");

        // A CPU without NX behaves like the forced-off case.
        assert_eq!(preferred_x86_kernel(true, false, &plain), "ntoskrnl.exe");

        // KERNEL= overrides skip the PAE rename.
        let mut with_override = CommandLine::default();
        with_override.kernel = Some(String::from("ntkrnlmp.exe"));
        assert_eq!(preferred_x86_kernel(true, true, &with_override), "ntoskrnl.exe");
    }

    #[test]
    fn forwarders_chain_across_images() {
        // lib-a forwards Frobnicate to lib-b.Target.
        let mut lib_a = minimal_pe(&[], &["Frobnicate"]);
        // Rewrite the export RVA to point inside the export directory, at a
        // forwarder string.
        let file = |rva: usize| rva - 0x1000 + 0x200;
        put32(&mut lib_a, file(0x1900), 0x19f0);
        put_str(&mut lib_a, file(0x19f0), "libb.Target");

        let lib_b = minimal_pe(&[], &["Target"]);

        let mut alloc = TestAlloc;
        let a = PeImage::load(&lib_a, None, &mut alloc, 1).unwrap();
        let b = PeImage::load(&lib_b, None, &mut alloc, 1).unwrap();

        let universe: Vec<(&str, &PeImage)> = vec![("liba.dll", &a), ("libb.dll", &b)];
        let address = lookup_forward(&universe, "liba.Frobnicate").unwrap();
        assert_eq!(address, b.current_base() + 0x1010);
    }
}
