//! Default `.mov` atom template (spec section 4.5 / `SPEC_FULL.md` section
//! 7), written in the mini-language `engine::mov::parse_template` accepts.
//! The atom nesting mirrors `examples/original_source/src/camogm_mov.c`'s
//! `write_header`: `ftyp`, a `moov` with one video `trak` (JPEG-in-MOV
//! sample entry) and the sample tables the packet stream fills in, then a
//! trailing `mdat` whose header is emitted by `!data_size` once the gap to
//! `data_start` is known.

pub const DEFAULT_MOV_TEMPLATE: &str = r#"
# File-type compatibility atom: QuickTime movie, no extended brands.
ftyp { "qt  " 00 00 00 00 "qt  " }

moov {
    mvhd {
        00 00 00 00        # version + flags
        !time !time         # creation / modification time
        !timescale !duration
        00 01 00 00        # preferred rate 1.0 (16.16)
        01 00              # preferred volume 1.0 (8.8)
        00 00 00 00 00 00 00 00 00 00  # reserved
        00 01 00 00 00 00 00 00 00 00  # matrix row 1
        00 00 00 01 00 00 00 00 00 00  # matrix row 2
        00 00 00 00 00 00 00 00 40 00  # matrix row 3
        00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00  # preview/poster/selection
        00 00 00 00        # current time
        00 00 00 02        # next track id
    }

    trak {
        tkhd {
            00 00 00 0f        # version + flags (enabled, in movie, in preview)
            !time !time
            00 00 00 01        # track id
            00 00 00 00        # reserved
            !duration
            00 00 00 00 00 00 00 00  # reserved
            00 00              # layer
            00 00              # alternate group
            00 00              # volume (video track: 0)
            00 00              # reserved
            00 01 00 00 00 00 00 00 00 00  # matrix row 1
            00 00 00 01 00 00 00 00 00 00  # matrix row 2
            00 00 00 00 00 00 00 00 40 00  # matrix row 3
            !width 00 00
            !height 00 00
        }

        mdia {
            mdhd {
                00 00 00 00
                !time !time
                !timescale !duration
                55 c4          # language (undetermined)
                00 00          # quality
            }

            hdlr {
                00 00 00 00
                00 00 00 00
                "vide"
                00 00 00 00 00 00 00 00 00 00 00 00
                "camogm video handler"
            }

            minf {
                vmhd {
                    00 00 00 01
                    00 00 00 00 00 00
                }

                stbl {
                    stsd {
                        00 00 00 00
                        00 00 00 01   # one sample description entry
                        jpeg {
                            00 00 00 00 00 00  # reserved
                            00 01              # data reference index
                            00 00              # version
                            00 00              # revision
                            00 00 00 00        # vendor
                            00 00 00 00        # temporal quality
                            00 00 00 00        # spatial quality
                            !width !height
                            00 48 00 00        # horizontal resolution 72dpi
                            00 48 00 00        # vertical resolution 72dpi
                            00 00 00 00        # data size
                            00 01              # frame count per sample
                            00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00  # compressor name
                            00 18              # depth
                            ff ff              # color table id (none)
                        }
                    }

                    stts {
                        00 00 00 00
                        00 00 00 01
                        !nframes !frame_duration
                    }

                    stsc {
                        00 00 00 00
                        00 00 00 01
                        00 00 00 01 !samples_chunk 00 00 00 01
                    }

                    stsz {
                        00 00 00 00
                        00 00 00 00
                        !sample_sizes
                    }

                    stco {
                        00 00 00 00
                        !chunk_offsets
                    }
                }
            }
        }
    }
}

!data_size
"#;
