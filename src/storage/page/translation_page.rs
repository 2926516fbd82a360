use byteorder::{ByteOrder, LittleEndian};

use super::{Location, PageHeaderMut, PageType, PAGE_HEADER_SIZE};

/// Indirection page: an array of physical locations indexed by the slot part
/// of a logical record id. A zero entry is unused.
pub struct TranslationPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> TranslationPage<B> {
    pub fn from_data(data: B) -> Self {
        Self { data }
    }

    /// Entries per translation page for a given block size.
    pub fn slots_per_page(block_size: usize) -> usize {
        (block_size - PAGE_HEADER_SIZE) / 8
    }

    pub fn get(&self, slot: usize) -> Location {
        Location(LittleEndian::read_u64(
            &self.data.as_ref()[PAGE_HEADER_SIZE + slot * 8..],
        ))
    }

    /// Slots holding a location, in slot order.
    pub fn used_slots(&self) -> impl Iterator<Item = (usize, Location)> + '_ {
        let count = Self::slots_per_page(self.data.as_ref().len());
        (0..count)
            .map(move |slot| (slot, self.get(slot)))
            .filter(|(_, loc)| !loc.is_none())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TranslationPage<B> {
    pub fn init(mut data: B) -> Self {
        data.as_mut().reset_body(PageType::Translation);
        Self { data }
    }

    pub fn set(&mut self, slot: usize, location: Location) {
        LittleEndian::write_u64(
            &mut self.data.as_mut()[PAGE_HEADER_SIZE + slot * 8..],
            location.0,
        );
    }
}
