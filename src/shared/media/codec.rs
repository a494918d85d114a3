//! G.711 μ-law ⇄ linear PCM16 transcoding.
//!
//! Everything here is a pure function of its input: no per-call state, one
//! contiguous output buffer per call. μ-law is always 8 kHz; PCM at a higher
//! multiple of 8 kHz is resampled on the way through.

/// Sample rate of G.711 μ-law.
pub const MULAW_SAMPLE_RATE: u32 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub byte_order: ByteOrder,
}

impl PcmFormat {
    /// `slin` as carried in RTP by the PBX (network byte order).
    pub const SLIN_RTP: PcmFormat = PcmFormat {
        sample_rate: 8000,
        channels: 1,
        byte_order: ByteOrder::Big,
    };

    /// Little-endian PCM16 at 8 kHz, as written to WAV files.
    pub const PCM16_LE: PcmFormat = PcmFormat {
        sample_rate: 8000,
        channels: 1,
        byte_order: ByteOrder::Little,
    };

    /// `pcm16` of the realtime voice service: 24 kHz mono little-endian.
    pub const REALTIME_PCM16: PcmFormat = PcmFormat {
        sample_rate: 24_000,
        channels: 1,
        byte_order: ByteOrder::Little,
    };

    fn frame_bytes(&self) -> usize {
        2 * usize::from(self.channels.max(1))
    }

    /// PCM frames per μ-law sample. Rates below 8 kHz or between multiples
    /// are treated as the nearest lower multiple.
    fn rate_ratio(&self) -> usize {
        (self.sample_rate / MULAW_SAMPLE_RATE).max(1) as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioCodec {
    format: PcmFormat,
}

impl AudioCodec {
    pub fn new(format: PcmFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Encodes interleaved PCM16 bytes to mono 8 kHz μ-law. Multi-channel
    /// frames are averaged; a trailing partial frame is dropped. Higher rates
    /// are decimated by averaging each group of frames.
    pub fn encode_mulaw(&self, pcm: &[u8]) -> Vec<u8> {
        let frame = self.format.frame_bytes();
        let channels = i32::from(self.format.channels.max(1));
        let mono: Vec<i32> = pcm
            .chunks_exact(frame)
            .map(|frame| {
                let sum: i32 = frame
                    .chunks_exact(2)
                    .map(|b| i32::from(self.read_sample([b[0], b[1]])))
                    .sum();
                sum / channels
            })
            .collect();
        mono.chunks(self.format.rate_ratio())
            .map(|group| {
                let avg = group.iter().sum::<i32>() / group.len() as i32;
                linear16_to_mulaw(avg as i16)
            })
            .collect()
    }

    /// Decodes 8 kHz μ-law to PCM16 bytes in this codec's format. Higher rates
    /// are filled by linear interpolation; the mono sample is duplicated across
    /// channels.
    pub fn decode_mulaw(&self, mulaw: &[u8]) -> Vec<u8> {
        let channels = usize::from(self.format.channels.max(1));
        let ratio = self.format.rate_ratio();
        let samples = decode_mulaw_samples(mulaw);
        let mut out = Vec::with_capacity(samples.len() * ratio * self.format.frame_bytes());
        for (i, &sample) in samples.iter().enumerate() {
            let from = i32::from(sample);
            let to = i32::from(samples.get(i + 1).copied().unwrap_or(sample));
            for step in 0..ratio {
                let value = from + (to - from) * step as i32 / ratio as i32;
                let bytes = self.write_sample(value as i16);
                for _ in 0..channels {
                    out.extend_from_slice(&bytes);
                }
            }
        }
        out
    }

    fn read_sample(&self, bytes: [u8; 2]) -> i16 {
        match self.format.byte_order {
            ByteOrder::Little => i16::from_le_bytes(bytes),
            ByteOrder::Big => i16::from_be_bytes(bytes),
        }
    }

    fn write_sample(&self, sample: i16) -> [u8; 2] {
        match self.format.byte_order {
            ByteOrder::Little => sample.to_le_bytes(),
            ByteOrder::Big => sample.to_be_bytes(),
        }
    }
}

/// Decodes μ-law to host samples (used for WAV writing).
pub fn decode_mulaw_samples(mulaw: &[u8]) -> Vec<i16> {
    mulaw.iter().map(|&mu| mulaw_to_linear16(mu)).collect()
}

pub fn mulaw_to_linear16(mu: u8) -> i16 {
    const BIAS: i16 = 0x84;
    let mu = !mu;
    let sign = (mu & 0x80) != 0;
    let segment = (mu & 0x70) >> 4;
    let mantissa = mu & 0x0F;

    let mut value = ((mantissa as i16) << 3) + BIAS;
    value <<= segment as i16;
    if sign {
        BIAS - value
    } else {
        value - BIAS
    }
}

pub fn linear16_to_mulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    // Largest magnitude that still fits segment 7 after biasing.
    const CLIP: i32 = 32635;

    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | ((exponent as u8) << 4) | mantissa)
}
