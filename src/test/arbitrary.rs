use crate::ring::Coord;

impl quickcheck::Arbitrary for Coord {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes: [u8; 32] = [0; 32];
        for byte in &mut bytes {
            *byte = u8::arbitrary(g);
        }
        Coord::from_bytes(bytes)
    }
}
