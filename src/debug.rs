use crate::image::ExecutableImage;

pub fn print_segment_table(image: &ExecutableImage) {
    println!("image={}", image.path());
    println!("entry_pc=0x{:016x}", image.entry());
    if let Some(ph) = image.program_headers() {
        println!("phdr=0x{:016x} phent={} phnum={}", ph.addr, ph.entry_size, ph.count);
    }
    println!("segments={}", image.segments().len());
    for (i, seg) in image.segments().iter().enumerate() {
        println!(
            "  seg[{}] vaddr=0x{:016x} memsz=0x{:x} fileoff=0x{:x} filesz=0x{:x} prot={}",
            i,
            seg.vaddr,
            seg.mem_size,
            seg.file_offset,
            seg.file_size,
            seg.perms.render(),
        );
    }
}
